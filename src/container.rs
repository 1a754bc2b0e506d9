//! Container Runtime (spec §4.4, component C4): runs one build step inside
//! a container and reports its outcome. Treated as an external capability
//! the way the teacher treats hardware — a narrow trait plus one concrete
//! implementation — grounded on the original implementation's
//! `Builder.__docker_run` (`server/aicert_server/aicert_server/builder.py`),
//! which shells out to the `docker` CLI rather than a client library.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;

use crate::cmd::CmdLine;
use crate::error::ContainerRunError;

/// One container invocation: the image to run it in, the command to run,
/// and the execution constraints the original implementation applies
/// per build step / finetune run.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    pub image: String,
    pub command: CmdLine,
    pub workspace_host_path: String,
    pub env: Vec<(String, String)>,
    pub network_disabled: bool,
    pub gpu: bool,
    /// Host/container port pairs to publish (spec §4.6: "a different command
    /// and published port set" for the serve step). Empty for build steps.
    pub published_ports: Vec<u16>,
}

/// A finished container's stdout/stderr and exit status. `stdout` carries
/// only the process's standard output, uncontaminated by stderr, for
/// callers that need to capture a single clean value out of a container —
/// e.g. the original implementation's `git rev-parse --verify HEAD`
/// content-identifier capture for git/repo resources (spec §4.5).
#[derive(Debug, Clone)]
pub struct ContainerOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub combined_output: String,
}

/// Container Runtime contract: run a step, and resolve an image reference
/// to a stable digest so the image-resolution cache can tell whether two
/// requests name the same underlying image.
pub trait ContainerRuntime: Send + Sync {
    fn run(&self, spec: &ContainerRun) -> Result<ContainerOutput, ContainerRunError>;

    /// Resolve `image` to a content digest, pulling it first if it is not
    /// already present locally.
    fn resolve_image(&self, image: &str) -> Result<String, ContainerRunError>;
}

/// Shells out to the `docker` CLI on `PATH`, matching the original
/// implementation's `docker run --rm -v ... -w /workspace ...` invocation.
pub struct DockerCliRuntime;

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCliRuntime {
    fn run(&self, spec: &ContainerRun) -> Result<ContainerOutput, ContainerRunError> {
        let rendered = spec.command.render().map_err(|e| ContainerRunError {
            image: spec.image.clone(),
            exit_code: None,
            output: e.to_string(),
        })?;

        let mut cmd = Command::new("docker");
        cmd.arg("run").arg("--rm");
        cmd.arg("-v")
            .arg(format!("{}:/workspace", spec.workspace_host_path));
        cmd.arg("-w").arg("/workspace");

        if spec.network_disabled {
            cmd.arg("--network").arg("none");
        }
        if spec.gpu {
            cmd.arg("--gpus").arg("all");
        }
        for port in &spec.published_ports {
            cmd.arg("-p").arg(format!("{port}:{port}"));
        }
        for (key, value) in &spec.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        cmd.arg(&spec.image);
        cmd.arg("/bin/sh").arg("-c").arg(rendered);

        let output = cmd.output().map_err(|e| ContainerRunError {
            image: spec.image.clone(),
            exit_code: None,
            output: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let combined_output = format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code != 0 {
            return Err(ContainerRunError {
                image: spec.image.clone(),
                exit_code: Some(exit_code),
                output: combined_output,
            });
        }

        Ok(ContainerOutput {
            exit_code,
            stdout,
            combined_output,
        })
    }

    fn resolve_image(&self, image: &str) -> Result<String, ContainerRunError> {
        let pull = Command::new("docker")
            .arg("pull")
            .arg("--quiet")
            .arg(image)
            .output()
            .map_err(|e| ContainerRunError {
                image: image.to_string(),
                exit_code: None,
                output: e.to_string(),
            })?;
        if !pull.status.success() {
            return Err(ContainerRunError {
                image: image.to_string(),
                exit_code: pull.status.code(),
                output: String::from_utf8_lossy(&pull.stderr).to_string(),
            });
        }

        let inspect = Command::new("docker")
            .arg("inspect")
            .arg("--format")
            .arg("{{.Id}}")
            .arg(image)
            .output()
            .map_err(|e| ContainerRunError {
                image: image.to_string(),
                exit_code: None,
                output: e.to_string(),
            })?;
        if !inspect.status.success() {
            return Err(ContainerRunError {
                image: image.to_string(),
                exit_code: inspect.status.code(),
                output: String::from_utf8_lossy(&inspect.stderr).to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&inspect.stdout).trim().to_string())
    }
}

/// Image-resolution cache (spec §4.4: "the first container run against a
/// new image must be preceded by exactly one `input_image` event").
///
/// Write-once per image reference: the first caller to resolve a given
/// image pays for the resolution and is told it was first, so it can emit
/// the `input_image` event before any container actually runs; every
/// later caller for the same reference gets the cached digest silently.
pub struct ImageCache {
    resolved: Mutex<HashMap<String, String>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self {
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `image`, returning `(digest, first_time)`. `first_time` is
    /// `true` exactly once per distinct `image` value for this cache's
    /// lifetime.
    pub fn resolve_once(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &str,
    ) -> Result<(String, bool), ContainerRunError> {
        let mut cache = self.resolved.lock().expect("image cache mutex poisoned");
        if let Some(digest) = cache.get(image) {
            return Ok((digest.clone(), false));
        }
        let digest = runtime.resolve_image(image)?;
        cache.insert(image.to_string(), digest.clone());
        Ok((digest, true))
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRuntime {
        resolutions: AtomicUsize,
    }

    impl ContainerRuntime for CountingRuntime {
        fn run(&self, _spec: &ContainerRun) -> Result<ContainerOutput, ContainerRunError> {
            unimplemented!("not exercised by these tests")
        }

        fn resolve_image(&self, image: &str) -> Result<String, ContainerRunError> {
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sha256:{image}"))
        }
    }

    #[test]
    fn resolves_once_per_distinct_image() {
        let runtime = CountingRuntime {
            resolutions: AtomicUsize::new(0),
        };
        let cache = ImageCache::new();

        let (digest_a, first_a) = cache.resolve_once(&runtime, "alpine:3.19").unwrap();
        let (digest_b, first_b) = cache.resolve_once(&runtime, "alpine:3.19").unwrap();
        let (_, first_c) = cache.resolve_once(&runtime, "debian:12").unwrap();

        assert_eq!(digest_a, digest_b);
        assert!(first_a);
        assert!(!first_b);
        assert!(first_c);
        assert_eq!(runtime.resolutions.load(Ordering::SeqCst), 2);
    }
}
