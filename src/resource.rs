//! Build input resources (spec §4.5, component C5): the declared-input
//! union type, `install_path` validation, and the container commands that
//! fetch each kind. Grounded on the original implementation's
//! `Resource` discriminated union (`common/aicert_common/protocol.py`) and
//! `Builder.__fetch_resource` (`server/aicert_server/aicert_server/builder.py`).
//!
//! The host process never reaches the network itself here — every fetch
//! is a command composed for a container (spec §9: "the host's own attack
//! surface for fetching arbitrary URLs is zero"). The host only hashes the
//! resulting bytes once they land on the shared workspace mount, except for
//! git-based resources, whose content identifier is the commit the clone
//! container itself resolved to — captured from that container's stdout,
//! never recomputed on the host.
//!
//! Every content identifier this module produces carries an algorithm tag
//! (`"sha256:"` or `"sha1:"`), matching the original implementation's hash
//! string format end to end: declared hashes in a [`Resource`] are expected
//! in the same tagged form.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cmd::CmdLine;
use crate::error::{ProtocolError, ResourceFetchError};

/// Default image used for resource-fetching container steps: has `curl`,
/// `git`, `git-lfs`, `tar`, and `poetry` for lockfile regeneration.
pub const DEFAULT_FETCH_IMAGE: &str = "ghcr.io/mithril-security/aicert-fetcher:latest";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Model,
    Dataset,
}

/// Lockfile ecosystem to regenerate after a `git` resource is checked out
/// (spec §4.5 edge case: "a resource whose fetch mutates state beyond the
/// clone itself"), grounded on the original implementation's Poetry
/// lockfile regeneration step in `__fetch_resource`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockfileKind {
    Poetry,
}

/// Whether a downloaded `file`/`archive` resource arrives gzip-compressed
/// (spec §3's `compression: none|gzip` field), grounded on the original
/// implementation's `spec.compression` branch in `__fetch_resource`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
}

/// A single declared build input. Tagged the way the wire protocol tags
/// it, by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    File {
        install_path: String,
        url: String,
        compression: Compression,
        sha256: Option<String>,
    },
    Archive {
        install_path: String,
        url: String,
        compression: Compression,
        sha256: Option<String>,
    },
    Git {
        install_path: String,
        repository: String,
        revision: Option<String>,
        /// Lockfile ecosystem to regenerate in-place after checkout, if any.
        #[serde(default)]
        deps: Option<LockfileKind>,
    },
    Repo {
        install_path: String,
        repo_type: RepoType,
        repository: String,
        commit: String,
    },
}

impl Resource {
    pub fn install_path(&self) -> &str {
        match self {
            Resource::File { install_path, .. }
            | Resource::Archive { install_path, .. }
            | Resource::Git { install_path, .. }
            | Resource::Repo { install_path, .. } => install_path,
        }
    }

    pub fn declared_sha256(&self) -> Option<&str> {
        match self {
            Resource::File { sha256, .. } | Resource::Archive { sha256, .. } => sha256.as_deref(),
            Resource::Git { .. } | Resource::Repo { .. } => None,
        }
    }
}

/// Reject any `install_path` that is absolute or escapes the workspace
/// root via a `..` component (spec §4.5 edge case, exercised end-to-end
/// in spec §8's "absolute path rejection" scenario).
pub fn validate_install_path(install_path: &str) -> Result<(), ProtocolError> {
    let path = Path::new(install_path);
    if path.is_absolute() {
        return Err(ProtocolError::AbsoluteOrEscapingPath(install_path.to_string()));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_)) {
            return Err(ProtocolError::AbsoluteOrEscapingPath(install_path.to_string()));
        }
    }
    Ok(())
}

/// A host-side check that must pass before a [`FetchStep`] runs, since it
/// depends on state only the host can see on the shared workspace mount
/// (spec §4.5: "require a pre-existing lockfile (or lockfile-source)").
pub struct LockfilePrecondition {
    pub kind: LockfileKind,
    pub relative_dir: String,
}

/// One container invocation needed to materialize a resource. A single
/// [`Resource`] may need several sequential steps (e.g. `git clone` then
/// `git checkout`); each step's container mounts the same host workspace
/// directory, so state from the previous step is visible to the next.
/// `capture_stdout` marks the step whose stdout (and no other step's)
/// becomes the resource's content identifier when `hash_source` is
/// [`HashSource::ContainerStdout`]. `precondition`, if set, must be
/// checked on the host workspace before the step runs. `extraction` marks
/// the step whose failure is an extraction failure rather than a generic
/// container failure.
pub struct FetchStep {
    pub image: String,
    pub command: CmdLine,
    pub capture_stdout: bool,
    pub precondition: Option<LockfilePrecondition>,
    pub extraction: bool,
}

/// Where a resource's content identifier comes from once its fetch steps
/// have run (spec §4.5: hash format differs by resource kind).
pub enum HashSource {
    /// The trimmed stdout of the fetch's one `capture_stdout` step,
    /// tagged `"sha1:"` — used for git-based resources, whose identifier
    /// is the commit the clone container resolved to.
    ContainerStdout,
    /// SHA-256 of whatever now lives at `install_path` in the workspace,
    /// tagged `"sha256:"` — used for plain file downloads.
    InstalledPath,
    /// SHA-256 of the raw bytes downloaded to `archive_path` (relative to
    /// the workspace root) before extraction, tagged `"sha256:"` — used
    /// for archives, whose identifier covers the downloaded bytes rather
    /// than the expanded tree.
    DownloadedArchive { archive_path: String },
}

/// The ordered container commands needed to materialize a resource, plus
/// where its content identifier comes from once they've run.
pub struct FetchPlan {
    pub steps: Vec<FetchStep>,
    pub hash_source: HashSource,
}

fn step(image: &str, command: CmdLine) -> FetchStep {
    FetchStep {
        image: image.to_string(),
        command,
        capture_stdout: false,
        precondition: None,
        extraction: false,
    }
}

fn capturing_step(image: &str, command: CmdLine) -> FetchStep {
    FetchStep {
        image: image.to_string(),
        command,
        capture_stdout: true,
        precondition: None,
        extraction: false,
    }
}

fn extraction_step(image: &str, command: CmdLine) -> FetchStep {
    FetchStep {
        image: image.to_string(),
        command,
        capture_stdout: false,
        precondition: None,
        extraction: true,
    }
}

/// Build the fetch plan for `resource`: the ordered container commands and
/// where its content identifier comes from. Call [`validate_install_path`]
/// first — this function does not re-check it.
pub fn fetch_plan(resource: &Resource) -> FetchPlan {
    match resource {
        Resource::File { url, install_path, compression, .. } => match compression {
            Compression::None => FetchPlan {
                steps: vec![step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["curl", "-sSL", "--create-dirs", "-o", install_path, url]),
                )],
                hash_source: HashSource::InstalledPath,
            },
            Compression::Gzip => {
                // Downloaded to a sibling path first so `--create-dirs` still
                // creates `install_path`'s own parent directory, then
                // decompressed in place onto the declared install path (spec
                // §4.5: "decompress in place"; §8's round-trip law holds
                // because `HashSource::InstalledPath` hashes the decompressed
                // bytes actually stored there).
                let download_path = format!("{install_path}.gz");
                FetchPlan {
                    steps: vec![
                        step(
                            DEFAULT_FETCH_IMAGE,
                            CmdLine::new(["curl", "-sSL", "--create-dirs", "-o", &download_path, url]),
                        ),
                        step(
                            DEFAULT_FETCH_IMAGE,
                            CmdLine::new(["gzip", "-c", "-d", &download_path]).redirect(install_path.clone()),
                        ),
                    ],
                    hash_source: HashSource::InstalledPath,
                }
            }
        },
        Resource::Archive { url, install_path, compression, .. } => {
            let archive_path = format!("{install_path}.download");
            let tar_flag = match compression {
                Compression::Gzip => "-xzf",
                Compression::None => "-xf",
            };
            FetchPlan {
                steps: vec![
                    step(
                        DEFAULT_FETCH_IMAGE,
                        CmdLine::new(["curl", "-sSL", "--create-dirs", "-o", &archive_path, url]),
                    ),
                    step(DEFAULT_FETCH_IMAGE, CmdLine::new(["mkdir", "-p", install_path])),
                    extraction_step(
                        DEFAULT_FETCH_IMAGE,
                        CmdLine::new(["tar", tar_flag, &archive_path, "-C", install_path]),
                    ),
                ],
                hash_source: HashSource::DownloadedArchive { archive_path },
            }
        }
        Resource::Git {
            repository,
            revision,
            install_path,
            deps,
        } => {
            let mut steps = vec![step(
                DEFAULT_FETCH_IMAGE,
                CmdLine::new(["git", "clone", repository, install_path]),
            )];
            if let Some(rev) = revision {
                steps.push(step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["git", "-C", install_path, "checkout", rev]),
                ));
            }
            if let Some(kind @ LockfileKind::Poetry) = deps {
                steps.push(FetchStep {
                    image: DEFAULT_FETCH_IMAGE.to_string(),
                    command: CmdLine::shell(format!("cd '{install_path}' && poetry lock --no-update")),
                    capture_stdout: false,
                    precondition: Some(LockfilePrecondition {
                        kind: *kind,
                        relative_dir: install_path.clone(),
                    }),
                    extraction: false,
                });
            }
            steps.push(capturing_step(
                DEFAULT_FETCH_IMAGE,
                CmdLine::new(["git", "-C", install_path, "rev-parse", "--verify", "HEAD"]),
            ));
            FetchPlan {
                steps,
                hash_source: HashSource::ContainerStdout,
            }
        }
        Resource::Repo {
            repository,
            commit,
            install_path,
            ..
        } => FetchPlan {
            steps: vec![
                step(DEFAULT_FETCH_IMAGE, CmdLine::new(["git", "lfs", "install"])),
                step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["git", "clone", repository, install_path]),
                ),
                step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["git", "-C", install_path, "fetch", "origin", commit]),
                ),
                step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["git", "-C", install_path, "reset", "--hard", "FETCH_HEAD"]),
                ),
                capturing_step(
                    DEFAULT_FETCH_IMAGE,
                    CmdLine::new(["git", "-C", install_path, "rev-parse", "--verify", "HEAD"]),
                ),
            ],
            hash_source: HashSource::ContainerStdout,
        },
    }
}

/// Check a [`FetchStep::precondition`] against the host-visible workspace
/// mount before the step runs (spec §4.5: "require a pre-existing lockfile
/// (or lockfile-source)"), grounded on the original implementation's
/// `(workspace / path / "poetry.lock").exists() or (... / "pyproject.toml").exists()`
/// check in `__fetch_resource` (raising 404 when neither is present).
pub fn check_lockfile_precondition(
    workspace_root: &Path,
    precondition: &LockfilePrecondition,
) -> Result<(), ResourceFetchError> {
    match precondition.kind {
        LockfileKind::Poetry => {
            let dir = workspace_root.join(&precondition.relative_dir);
            let has_source = dir.join("poetry.lock").exists() || dir.join("pyproject.toml").exists();
            if !has_source {
                return Err(ResourceFetchError::MissingLockfileSource {
                    install_path: precondition.relative_dir.clone(),
                });
            }
            Ok(())
        }
    }
}

/// SHA-256 of whatever now lives at `workspace_root.join(relative_path)`:
/// a single file hashes its bytes; a directory hashes the sorted
/// concatenation of `relative_path\0content` for every file under it, so
/// the digest is stable regardless of the OS's directory-walk order.
fn sha256_of_workspace_path(
    workspace_root: &Path,
    relative_path: &str,
) -> Result<String, ResourceFetchError> {
    let full_path = workspace_root.join(relative_path);
    let metadata = std::fs::metadata(&full_path).map_err(|e| ResourceFetchError::FetchFailed {
        install_path: relative_path.to_string(),
        reason: e.to_string(),
    })?;

    if metadata.is_file() {
        let bytes = std::fs::read(&full_path).map_err(|e| ResourceFetchError::FetchFailed {
            install_path: relative_path.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(hex::encode(Sha256::digest(bytes)));
    }

    let mut relative_paths = Vec::new();
    for entry in walkdir::WalkDir::new(&full_path)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(&full_path)
                .expect("walkdir entries are under full_path")
                .to_string_lossy()
                .into_owned();
            relative_paths.push(relative);
        }
    }
    relative_paths.sort();

    let mut hasher = Sha256::new();
    for relative in relative_paths {
        let bytes = std::fs::read(full_path.join(&relative)).map_err(|e| {
            ResourceFetchError::FetchFailed {
                install_path: relative_path.to_string(),
                reason: e.to_string(),
            }
        })?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve a resource's content identifier from `hash_source`, given the
/// trimmed stdout of its `capture_stdout` step (if it had one). Returns a
/// tagged string (`"sha256:..."` or `"sha1:..."`), matching the original
/// implementation's hash string format.
pub fn resolve_hash(
    workspace_root: &Path,
    install_path: &str,
    hash_source: &HashSource,
    captured_stdout: Option<&str>,
) -> Result<String, ResourceFetchError> {
    match hash_source {
        HashSource::ContainerStdout => {
            let rev = captured_stdout
                .ok_or_else(|| ResourceFetchError::FetchFailed {
                    install_path: install_path.to_string(),
                    reason: "expected a captured container stdout for this resource".to_string(),
                })?
                .trim();
            Ok(format!("sha1:{rev}"))
        }
        HashSource::InstalledPath => {
            Ok(format!("sha256:{}", sha256_of_workspace_path(workspace_root, install_path)?))
        }
        HashSource::DownloadedArchive { archive_path } => {
            Ok(format!("sha256:{}", sha256_of_workspace_path(workspace_root, archive_path)?))
        }
    }
}

/// Verify a fetched resource's tagged content identifier against what was
/// declared, if anything was declared (spec §4.5 edge case: unverified
/// resources are allowed, but a declared hash must match exactly).
pub fn verify_hash(resource: &Resource, actual_hash: &str) -> Result<(), ResourceFetchError> {
    if let Some(expected) = resource.declared_sha256() {
        if !expected.eq_ignore_ascii_case(actual_hash) {
            return Err(ResourceFetchError::HashMismatch {
                install_path: resource.install_path().to_string(),
                expected: expected.to_string(),
                actual: actual_hash.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_install_path() {
        assert!(validate_install_path("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_dir_escape() {
        assert!(validate_install_path("../../etc/passwd").is_err());
        assert!(validate_install_path("models/../../etc/passwd").is_err());
    }

    #[test]
    fn accepts_a_plain_relative_path() {
        assert!(validate_install_path("models/weights.bin").is_ok());
    }

    #[test]
    fn git_with_revision_emits_a_checkout_step() {
        let resource = Resource::Git {
            install_path: "repo".to_string(),
            repository: "https://example.com/repo.git".to_string(),
            revision: Some("abc123".to_string()),
            deps: None,
        };
        let plan = fetch_plan(&resource);
        assert_eq!(plan.steps.len(), 3); // clone, checkout, rev-parse capture
        assert!(plan.steps.last().unwrap().capture_stdout);
    }

    #[test]
    fn git_with_poetry_deps_regenerates_the_lockfile() {
        let resource = Resource::Git {
            install_path: "repo".to_string(),
            repository: "https://example.com/repo.git".to_string(),
            revision: None,
            deps: Some(LockfileKind::Poetry),
        };
        let plan = fetch_plan(&resource);
        // clone, poetry lock, rev-parse capture
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps[1].command.render().unwrap().contains("poetry lock"));
        let precondition = plan.steps[1]
            .precondition
            .as_ref()
            .expect("the poetry lock step must gate on a lockfile precondition");
        assert!(matches!(precondition.kind, LockfileKind::Poetry));
        assert_eq!(precondition.relative_dir, "repo");
    }

    #[test]
    fn poetry_precondition_rejects_a_checkout_with_no_lockfile_source() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("repo")).unwrap();
        let precondition = LockfilePrecondition {
            kind: LockfileKind::Poetry,
            relative_dir: "repo".to_string(),
        };
        let err = check_lockfile_precondition(workspace.path(), &precondition).unwrap_err();
        assert!(matches!(err, ResourceFetchError::MissingLockfileSource { .. }));
    }

    #[test]
    fn poetry_precondition_accepts_an_existing_pyproject() {
        let workspace = tempfile::tempdir().unwrap();
        let repo_dir = workspace.path().join("repo");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("pyproject.toml"), b"[tool.poetry]\n").unwrap();
        let precondition = LockfilePrecondition {
            kind: LockfileKind::Poetry,
            relative_dir: "repo".to_string(),
        };
        check_lockfile_precondition(workspace.path(), &precondition).unwrap();
    }

    #[test]
    fn gzip_file_resource_decompresses_in_place() {
        let resource = Resource::File {
            install_path: "weights.bin".to_string(),
            url: "https://example.com/weights.bin.gz".to_string(),
            compression: Compression::Gzip,
            sha256: None,
        };
        let plan = fetch_plan(&resource);
        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(plan.hash_source, HashSource::InstalledPath));
        let decompress = plan.steps[1].command.render().unwrap();
        assert!(decompress.contains("gzip"));
        assert!(decompress.contains("weights.bin.gz"));
        assert!(decompress.ends_with("'weights.bin'"));
    }

    #[test]
    fn plain_file_resource_downloads_directly_with_no_decompress_step() {
        let resource = Resource::File {
            install_path: "weights.bin".to_string(),
            url: "https://example.com/weights.bin".to_string(),
            compression: Compression::None,
            sha256: None,
        };
        let plan = fetch_plan(&resource);
        assert_eq!(plan.steps.len(), 1);
        assert!(!plan.steps[0].command.render().unwrap().contains("gzip"));
    }

    #[test]
    fn plain_archive_extracts_without_the_gzip_flag() {
        let resource = Resource::Archive {
            install_path: "data".to_string(),
            url: "https://example.com/data.tar".to_string(),
            compression: Compression::None,
            sha256: None,
        };
        let plan = fetch_plan(&resource);
        let extract = plan.steps.last().unwrap();
        assert!(extract.extraction);
        let rendered = extract.command.render().unwrap();
        assert!(rendered.contains("'-xf'"));
        assert!(!rendered.contains("-xzf"));
    }

    #[test]
    fn gzip_archive_extracts_with_the_gzip_flag() {
        let resource = Resource::Archive {
            install_path: "data".to_string(),
            url: "https://example.com/data.tar.gz".to_string(),
            compression: Compression::Gzip,
            sha256: None,
        };
        let plan = fetch_plan(&resource);
        let rendered = plan.steps.last().unwrap().command.render().unwrap();
        assert!(rendered.contains("-xzf"));
    }

    #[test]
    fn repo_fetch_uses_git_lfs_not_huggingface_cli() {
        let resource = Resource::Repo {
            install_path: "models/base".to_string(),
            repo_type: RepoType::Model,
            repository: "https://huggingface.co/org/model".to_string(),
            commit: "deadbeefcafe".to_string(),
        };
        let plan = fetch_plan(&resource);
        let rendered: Vec<String> = plan.steps.iter().map(|s| s.command.render().unwrap()).collect();
        assert!(rendered.iter().any(|r| r.contains("lfs")));
        assert!(rendered.iter().all(|r| !r.contains("huggingface-cli")));
        assert!(plan.steps.last().unwrap().capture_stdout);
    }

    #[test]
    fn git_hash_is_tagged_sha1_from_captured_stdout() {
        let resource = Resource::Git {
            install_path: "repo".to_string(),
            repository: "https://example.com/repo.git".to_string(),
            revision: None,
            deps: None,
        };
        let plan = fetch_plan(&resource);
        let hash = resolve_hash(
            Path::new("/workspace"),
            resource.install_path(),
            &plan.hash_source,
            Some("deadbeefcafef00d\n"),
        )
        .unwrap();
        assert_eq!(hash, "sha1:deadbeefcafef00d");
    }

    #[test]
    fn verify_hash_rejects_mismatch() {
        let resource = Resource::File {
            install_path: "f.bin".to_string(),
            url: "https://example.com/f.bin".to_string(),
            compression: Compression::None,
            sha256: Some("sha256:deadbeef".to_string()),
        };
        assert!(verify_hash(&resource, "sha256:cafebabe").is_err());
        assert!(verify_hash(&resource, "sha256:deadbeef").is_ok());
        assert!(verify_hash(&resource, "SHA256:DEADBEEF").is_ok());
    }

    #[test]
    fn verify_hash_allows_unverified_resources() {
        let resource = Resource::File {
            install_path: "f.bin".to_string(),
            url: "https://example.com/f.bin".to_string(),
            compression: Compression::None,
            sha256: None,
        };
        assert!(verify_hash(&resource, "anything").is_ok());
    }
}
