//! Command Composer (spec §4.4, §4.5): builds POSIX shell pipelines for
//! resource fetching and build steps. Ported from the original
//! implementation's `CmdLine` (`server/aicert_server/cmd_line.py`): a small
//! builder over `extend`/`pipe`/`redirect`/`append_to`/`then`, rendered as
//! a single shell string handed to `/bin/sh -c`.
//!
//! Every argument but the first in a stage is wrapped in single quotes
//! rather than shell-escaped, so an argument containing a single quote is
//! rejected outright instead of being escaped — the same invariant the
//! original enforces by never accepting one in the first place. The first
//! token of a stage is the program name and is emitted unquoted, matching
//! `format_line`'s handling of `line[0]` in the original implementation.

use std::process::Command;

use crate::error::CmdLineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedirectMode {
    Truncate,
    Append,
}

/// A single stage of a pipeline: either a list of arguments (first token
/// unquoted as the program name, the rest quoted individually), or a
/// verbatim shell snippet passed through untouched (used for the build
/// step's own command, which is itself a shell script the caller wrote,
/// not a single quoted token).
#[derive(Debug, Clone)]
enum Stage {
    Args(Vec<String>),
    Verbatim(String),
}

/// One POSIX shell pipeline: one or more piped stages, with an optional
/// trailing redirect.
#[derive(Debug, Clone)]
struct Line {
    stages: Vec<Stage>,
    redirect: Option<(String, RedirectMode)>,
}

/// A sequence of [`Line`]s, joined with `&&` so each only runs if the
/// previous one succeeded — matching the original implementation's
/// multi-line `CmdLine` construction.
#[derive(Debug, Clone)]
pub struct CmdLine {
    lines: Vec<Line>,
}

impl CmdLine {
    /// Start a pipeline with its first stage's arguments: the first token
    /// is the program name (unquoted), the rest are quoted individually.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: vec![Line {
                stages: vec![Stage::Args(args.into_iter().map(Into::into).collect())],
                redirect: None,
            }],
        }
    }

    /// Start a pipeline whose single stage is a verbatim shell snippet —
    /// passed to `/bin/sh -c` exactly as given, with no quoting applied.
    /// Used for a caller-supplied build command, which is already shell
    /// script rather than a single argument.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            lines: vec![Line {
                stages: vec![Stage::Verbatim(command.into())],
                redirect: None,
            }],
        }
    }

    fn last_line_mut(&mut self) -> &mut Line {
        self.lines.last_mut().expect("CmdLine always has at least one line")
    }

    /// Append arguments to the current (last) stage of the current (last)
    /// line. Panics if that stage is [`Stage::Verbatim`] — a verbatim
    /// stage cannot be extended with individually quoted arguments.
    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self
            .last_line_mut()
            .stages
            .last_mut()
            .expect("a Line always has at least one stage")
        {
            Stage::Args(existing) => existing.extend(args.into_iter().map(Into::into)),
            Stage::Verbatim(_) => panic!("cannot extend a verbatim CmdLine stage"),
        }
        self
    }

    /// Start a new stage within the current line, piped from the previous
    /// one's stdout.
    pub fn pipe<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.last_line_mut()
            .stages
            .push(Stage::Args(args.into_iter().map(Into::into).collect()));
        self
    }

    /// Redirect the current line's final stdout to `path`, truncating it.
    pub fn redirect(mut self, path: impl Into<String>) -> Self {
        self.last_line_mut().redirect = Some((path.into(), RedirectMode::Truncate));
        self
    }

    /// Redirect the current line's final stdout to `path`, appending to it.
    pub fn append_to(mut self, path: impl Into<String>) -> Self {
        self.last_line_mut().redirect = Some((path.into(), RedirectMode::Append));
        self
    }

    /// Sequence a new pipeline after the current one, joined with `&&` so
    /// it only runs if everything before it succeeded (spec §4.4/§4.5:
    /// lockfile regeneration, multi-step fetches).
    pub fn then<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.push(Line {
            stages: vec![Stage::Args(args.into_iter().map(Into::into).collect())],
            redirect: None,
        });
        self
    }

    /// Sequence a verbatim shell snippet after the current one, joined
    /// with `&&`.
    pub fn then_shell(mut self, command: impl Into<String>) -> Self {
        self.lines.push(Line {
            stages: vec![Stage::Verbatim(command.into())],
            redirect: None,
        });
        self
    }

    fn format_arg(arg: &str) -> Result<String, CmdLineError> {
        if arg.contains('\'') {
            return Err(CmdLineError::UnquotableArgument(arg.to_string()));
        }
        Ok(format!("'{arg}'"))
    }

    fn render_stage(stage: &Stage) -> Result<String, CmdLineError> {
        match stage {
            Stage::Args(args) => {
                let mut tokens = args.iter();
                let mut parts = Vec::with_capacity(args.len());
                if let Some(first) = tokens.next() {
                    if first.contains('\'') {
                        return Err(CmdLineError::UnquotableArgument(first.clone()));
                    }
                    parts.push(first.clone());
                }
                for arg in tokens {
                    parts.push(Self::format_arg(arg)?);
                }
                Ok(parts.join(" "))
            }
            Stage::Verbatim(text) => Ok(text.clone()),
        }
    }

    fn render_line(line: &Line) -> Result<String, CmdLineError> {
        let mut stage_strings = Vec::with_capacity(line.stages.len());
        for stage in &line.stages {
            stage_strings.push(Self::render_stage(stage)?);
        }
        let mut rendered = stage_strings.join(" | ");

        if let Some((path, mode)) = &line.redirect {
            let op = match mode {
                RedirectMode::Truncate => ">",
                RedirectMode::Append => ">>",
            };
            rendered.push(' ');
            rendered.push_str(op);
            rendered.push(' ');
            rendered.push_str(&Self::format_arg(path)?);
        }

        Ok(rendered)
    }

    /// Render the full sequence to a single POSIX shell string.
    pub fn render(&self) -> Result<String, CmdLineError> {
        let mut rendered_lines = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            rendered_lines.push(Self::render_line(line)?);
        }
        Ok(rendered_lines.join(" && "))
    }

    /// Build a [`Command`] that runs this pipeline through `/bin/sh -c`.
    pub fn to_command(&self) -> Result<Command, CmdLineError> {
        let rendered = self.render()?;
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(rendered);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_single_stage_with_program_unquoted() {
        let cmd = CmdLine::new(["echo", "hi"]);
        assert_eq!(cmd.render().unwrap(), "echo 'hi'");
    }

    #[test]
    fn renders_a_pipe() {
        let cmd = CmdLine::new(["cat", "file.txt"]).pipe(["sha256sum"]);
        assert_eq!(cmd.render().unwrap(), "cat 'file.txt' | sha256sum");
    }

    #[test]
    fn renders_a_redirect() {
        let cmd = CmdLine::new(["echo", "hi"]).redirect("out.txt");
        assert_eq!(cmd.render().unwrap(), "echo 'hi' > 'out.txt'");
    }

    #[test]
    fn renders_an_append() {
        let cmd = CmdLine::new(["echo", "hi"]).append_to("out.txt");
        assert_eq!(cmd.render().unwrap(), "echo 'hi' >> 'out.txt'");
    }

    #[test]
    fn extend_adds_to_the_last_stage() {
        let cmd = CmdLine::new(["git", "clone"]).extend(["--depth", "1"]);
        assert_eq!(cmd.render().unwrap(), "git 'clone' '--depth' '1'");
    }

    #[test]
    fn shell_stage_is_passed_through_verbatim() {
        let cmd = CmdLine::shell("make && make install");
        assert_eq!(cmd.render().unwrap(), "make && make install");
    }

    #[test]
    fn then_joins_lines_with_short_circuit_and() {
        let cmd = CmdLine::new(["git", "fetch"]).then(["git", "reset", "--hard"]);
        assert_eq!(cmd.render().unwrap(), "git 'fetch' && git 'reset' '--hard'");
    }

    #[test]
    fn then_after_pipe_and_redirect_chains_three_lines() {
        let cmd = CmdLine::new(["git", "lfs", "install"])
            .then(["git", "clone", "https://example/repo.git", "install/path"])
            .then(["git", "fetch", "origin", "deadbeef"]);
        assert_eq!(
            cmd.render().unwrap(),
            "git 'lfs' 'install' && git 'clone' 'https://example/repo.git' 'install/path' && git 'fetch' 'origin' 'deadbeef'"
        );
    }

    #[test]
    fn rejects_single_quote_in_a_non_program_argument() {
        let cmd = CmdLine::new(["echo", "it's"]);
        assert!(matches!(cmd.render(), Err(CmdLineError::UnquotableArgument(_))));
    }

    #[test]
    fn rejects_single_quote_in_the_program_token() {
        let cmd = CmdLine::new(["ec'ho", "hi"]);
        assert!(matches!(cmd.render(), Err(CmdLineError::UnquotableArgument(_))));
    }
}
