//! Builder (spec §4.3, component C3): the single-shot build state machine.
//!
//! Grounded on the original implementation's `Builder` class
//! (`server/aicert_server/aicert_server/builder.py`): a class-attribute
//! singleton guarded by one lock, running the actual build on a worker
//! thread so the HTTP layer never blocks on it. Here the singleton is an
//! instance behind `Arc`, the lock is a `std::sync::Mutex`, and the worker
//! is a dedicated `std::thread` — not a tokio task, because every step
//! (subprocess calls, TPM I/O) is blocking I/O the teacher's own HAL
//! boundary treats as synchronous. The async HTTP shell bridges in via
//! `tokio::task::spawn_blocking` (spec §5).

pub mod finetune;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::PlatformConfig;
use crate::container::{ContainerRun, ContainerRuntime, ImageCache};
use crate::error::{BuildError, ProtocolError, ResourceFetchError};
use crate::event::{EventLog, OutputFile};
use crate::protocol::{BuildRequest, OutputFileDescriptor, ServeRequest};
use crate::resource::{
    check_lockfile_precondition, fetch_plan, resolve_hash, validate_install_path, verify_hash, Resource,
};
use crate::tpm::TpmGateway;

/// Reported by `GET /build/status` (spec §6). Never carries the full
/// attestation bundle — that is a separate, idempotent read once the
/// build is done.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    Idle,
    Running,
    Succeeded,
    /// A serve step has been submitted and is running (or has completed)
    /// against the build's resolved image (spec §4.6, §6 `POST /submit_serve`).
    Serving,
    Failed { error: String, status_code: u16 },
}

enum BuildState {
    Idle,
    Running,
    Succeeded {
        event_log: Arc<EventLog>,
        outputs: Vec<OutputFile>,
        resolved_image: String,
    },
    Serving {
        event_log: Arc<EventLog>,
        outputs: Vec<OutputFile>,
    },
    Failed {
        event_log: Arc<EventLog>,
        error: String,
        status_code: u16,
    },
}

/// The single-shot build runner. One instance serves exactly one build
/// for its lifetime (spec §4.3: "accepts exactly one build per runner
/// lifetime; a second submission is rejected, not queued").
pub struct Builder {
    gateway: Arc<dyn TpmGateway>,
    runtime: Arc<dyn ContainerRuntime>,
    platform: PlatformConfig,
    workspace: PathBuf,
    image_cache: Arc<ImageCache>,
    state: Arc<Mutex<BuildState>>,
    serve_started: Arc<Mutex<bool>>,
    finetune: finetune::FinetuneRunner,
}

impl Builder {
    pub fn new(
        gateway: Arc<dyn TpmGateway>,
        runtime: Arc<dyn ContainerRuntime>,
        platform: PlatformConfig,
        workspace: PathBuf,
    ) -> Self {
        let image_cache = Arc::new(ImageCache::new());
        let finetune = finetune::FinetuneRunner::new(
            gateway.clone(),
            runtime.clone(),
            platform.clone(),
            workspace.clone(),
            image_cache.clone(),
        );
        Self {
            gateway,
            runtime,
            platform,
            workspace,
            image_cache,
            state: Arc::new(Mutex::new(BuildState::Idle)),
            serve_started: Arc::new(Mutex::new(false)),
            finetune,
        }
    }

    /// Accept a build request, transition `Idle -> Running`, and start the
    /// worker thread. Rejects a second submission (spec §4.3, §8 "double
    /// submit" scenario).
    pub fn submit(&self, request: BuildRequest) -> Result<(), ProtocolError> {
        if std::path::Path::new(&request.output_pattern).is_absolute() {
            return Err(ProtocolError::AbsoluteOutputPattern(request.output_pattern));
        }

        let mut guard = self.state.lock().expect("builder state mutex poisoned");
        if !matches!(*guard, BuildState::Idle) {
            return Err(ProtocolError::AlreadySubmitted);
        }
        *guard = BuildState::Running;
        drop(guard);

        let state = self.state.clone();
        let gateway = self.gateway.clone();
        let runtime = self.runtime.clone();
        let image_cache = self.image_cache.clone();
        let platform = self.platform.clone();
        let workspace = self.workspace.clone();

        thread::spawn(move || {
            run_build(state, gateway, runtime, image_cache, platform, workspace, request);
        });

        Ok(())
    }

    pub fn status(&self) -> BuildStatus {
        match &*self.state.lock().expect("builder state mutex poisoned") {
            BuildState::Idle => BuildStatus::Idle,
            BuildState::Running => BuildStatus::Running,
            BuildState::Succeeded { .. } => BuildStatus::Succeeded,
            BuildState::Serving { .. } => BuildStatus::Serving,
            BuildState::Failed { error, status_code, .. } => BuildStatus::Failed {
                error: error.clone(),
                status_code: *status_code,
            },
        }
    }

    /// The event log backing a completed (or serving) build, for the
    /// Attestation Assembler to read (spec §4.7 `attest()`). A pure read:
    /// does not itself transition the build state.
    pub fn attestation_event_log(&self) -> Result<Arc<EventLog>, ProtocolError> {
        match &*self.state.lock().expect("builder state mutex poisoned") {
            BuildState::Succeeded { event_log, .. } | BuildState::Serving { event_log, .. } => {
                Ok(event_log.clone())
            }
            BuildState::Idle => Err(ProtocolError::NotServeReady("idle".to_string())),
            BuildState::Running => Err(ProtocolError::NotServeReady("running".to_string())),
            BuildState::Failed { .. } => Err(ProtocolError::NotServeReady("failed".to_string())),
        }
    }

    /// Accept a serve step: reuse the completed build's resolved image with
    /// a different command and published ports (spec §4.6 "Succeeded --serve-->
    /// Serving"; §6 `POST /submit_serve`). May only start from `Succeeded`,
    /// and only once (spec §4.3's single-shot guarantee applies per step).
    pub fn submit_serve(&self, request: ServeRequest) -> Result<(), ProtocolError> {
        let mut serve_guard = self.serve_started.lock().expect("serve guard mutex poisoned");
        if *serve_guard {
            return Err(ProtocolError::AlreadySubmitted);
        }

        let resolved_image = match &*self.state.lock().expect("builder state mutex poisoned") {
            BuildState::Succeeded { resolved_image, .. } => resolved_image.clone(),
            BuildState::Serving { .. } => return Err(ProtocolError::AlreadySubmitted),
            BuildState::Idle => return Err(ProtocolError::NotServeReady("idle".to_string())),
            BuildState::Running => return Err(ProtocolError::NotServeReady("running".to_string())),
            BuildState::Failed { .. } => return Err(ProtocolError::NotServeReady("failed".to_string())),
        };
        *serve_guard = true;
        drop(serve_guard);

        let state = self.state.clone();
        let runtime = self.runtime.clone();
        let workspace = self.workspace.clone();

        thread::spawn(move || {
            run_serve(state, runtime, workspace, resolved_image, request);
        });

        Ok(())
    }

    pub fn gateway(&self) -> Arc<dyn TpmGateway> {
        self.gateway.clone()
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn list_outputs(&self) -> Result<Vec<OutputFileDescriptor>, ProtocolError> {
        let guard = self.state.lock().expect("builder state mutex poisoned");
        let outputs = match &*guard {
            BuildState::Succeeded { outputs, .. } | BuildState::Serving { outputs, .. } => outputs,
            BuildState::Idle => return Err(ProtocolError::NotServeReady("idle".to_string())),
            BuildState::Running => return Err(ProtocolError::NotServeReady("running".to_string())),
            BuildState::Failed { .. } => return Err(ProtocolError::NotServeReady("failed".to_string())),
        };
        Ok(outputs
            .iter()
            .map(|o| OutputFileDescriptor {
                path: o.path.clone(),
                sha256: o.sha256.clone(),
            })
            .collect())
    }

    pub fn read_output(&self, requested_path: &str) -> Result<Vec<u8>, ProtocolError> {
        if std::path::Path::new(requested_path).is_absolute() {
            return Err(ProtocolError::AbsoluteOutputPattern(requested_path.to_string()));
        }
        let outputs = self.list_outputs()?;
        if !outputs.iter().any(|o| o.path == requested_path) {
            return Err(ProtocolError::OutputNotFound(requested_path.to_string()));
        }
        std::fs::read(self.workspace.join(requested_path))
            .map_err(|_| ProtocolError::OutputNotFound(requested_path.to_string()))
    }

    /// Register an Axolotl configuration (spec §6 `POST /axolotl/configuration`).
    /// Delegates entirely to the finetune runner, which records a
    /// `configuration` event immediately rather than waiting for the run to
    /// start (spec §9: the event log must reflect what was submitted even
    /// if the run is never started).
    pub fn register_axolotl_config(&self, config: crate::protocol::AxolotlConfig) -> Result<(), ProtocolError> {
        self.finetune.register_config(config)
    }

    pub fn start_finetune(&self) -> Result<(), ProtocolError> {
        self.finetune.start()
    }

    pub fn finetune_status(&self) -> finetune::FinetuneStatus {
        self.finetune.status()
    }

    pub fn finetune_event_log(&self) -> Arc<EventLog> {
        self.finetune.event_log()
    }

    /// Path of the text log `GET /build/status` tails (spec §6). Plain
    /// status lines, not the attestation event log.
    pub fn build_log_path(&self) -> PathBuf {
        build_log_path(&self.workspace)
    }
}

fn build_log_path(workspace: &std::path::Path) -> PathBuf {
    workspace.join(".aicert-build.log")
}

/// Append one timestamped line to the build's status log. Best-effort: a
/// failure to write the log must never fail the build itself.
fn log_build_line(workspace: &std::path::Path, message: impl std::fmt::Display) {
    use std::io::Write;
    let line = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), message);
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(build_log_path(workspace))
    {
        let _ = file.write_all(line.as_bytes());
    }
}

/// Shared resource-fetch-and-record step used by both the build path and
/// the finetune path (spec §4.5): resolve the fetch image once per cache,
/// run the resource's fetch plan, resolve its content identifier, verify it
/// against any declared hash, and append the `input_resource` event.
pub(crate) fn fetch_and_record_resource(
    resource: &Resource,
    runtime: &dyn ContainerRuntime,
    image_cache: &ImageCache,
    workspace: &std::path::Path,
    event_log: &EventLog,
) -> Result<(), BuildError> {
    let (digest, first_time) =
        image_cache.resolve_once(runtime, crate::resource::DEFAULT_FETCH_IMAGE)?;
    if first_time {
        event_log.input_image(format!("{}@{digest}", crate::resource::DEFAULT_FETCH_IMAGE))?;
    }

    let plan = fetch_plan(resource);
    let mut captured_stdout = None;
    for step in plan.steps {
        if let Some(precondition) = &step.precondition {
            check_lockfile_precondition(workspace, precondition)?;
        }

        let run_result = runtime.run(&ContainerRun {
            image: step.image,
            command: step.command,
            workspace_host_path: workspace.to_string_lossy().into_owned(),
            env: Vec::new(),
            network_disabled: false,
            gpu: false,
            published_ports: Vec::new(),
        });
        let output = match run_result {
            Ok(output) => output,
            Err(e) if step.extraction => {
                return Err(BuildError::ResourceFetch(ResourceFetchError::ExtractionFailed {
                    install_path: resource.install_path().to_string(),
                    reason: e.to_string(),
                }))
            }
            Err(e) => return Err(e.into()),
        };
        if step.capture_stdout {
            captured_stdout = Some(output.stdout);
        }
    }

    let actual_hash = resolve_hash(
        workspace,
        resource.install_path(),
        &plan.hash_source,
        captured_stdout.as_deref(),
    )?;
    verify_hash(resource, &actual_hash)?;
    event_log.input_resource(resource.install_path(), actual_hash)?;
    Ok(())
}

fn run_build(
    state: Arc<Mutex<BuildState>>,
    gateway: Arc<dyn TpmGateway>,
    runtime: Arc<dyn ContainerRuntime>,
    image_cache: Arc<ImageCache>,
    platform: PlatformConfig,
    workspace: PathBuf,
    request: BuildRequest,
) {
    let event_log = Arc::new(EventLog::new(gateway, platform.measurement_pcr));
    log_build_line(&workspace, "build started");

    let result = (|| -> Result<(Vec<OutputFile>, String), BuildError> {
        // Validate every install_path before any side effect, including the
        // build_request event itself (spec's "absolute path rejection"
        // scenario requires an empty event log and an unchanged PCR).
        for resource in &request.resources {
            validate_install_path(resource.install_path())?;
        }

        let request_value = serde_json::to_value(&request)
            .map_err(|e| BuildError::Internal(format!("build request did not serialize: {e}")))?;
        event_log.build_request(request_value)?;

        for resource in &request.resources {
            log_build_line(&workspace, format_args!("fetching resource {}", resource.install_path()));
            fetch_and_record_resource(resource, runtime.as_ref(), &image_cache, &workspace, &event_log)?;
        }

        log_build_line(&workspace, format_args!("resolving image {}", request.image));
        let (digest, first_time) = image_cache.resolve_once(runtime.as_ref(), &request.image)?;
        if first_time {
            event_log.input_image(format!("{}@{digest}", request.image))?;
        }
        let resolved_image = format!("{}@{digest}", request.image);

        log_build_line(&workspace, "running build container");
        runtime.run(&ContainerRun {
            image: request.image.clone(),
            command: crate::cmd::CmdLine::shell(request.command.clone()),
            workspace_host_path: workspace.to_string_lossy().into_owned(),
            env: Vec::new(),
            network_disabled: false,
            gpu: request.gpu,
            published_ports: Vec::new(),
        })?;

        let outputs = collect_outputs(&workspace, &request.output_pattern)?;
        if outputs.is_empty() {
            return Err(BuildError::NoOutputs(request.output_pattern.clone()));
        }
        event_log.outputs(outputs.clone())?;
        Ok((outputs, resolved_image))
    })();

    let mut guard = state.lock().expect("builder state mutex poisoned");
    *guard = match result {
        Ok((outputs, resolved_image)) => {
            log_build_line(&workspace, format_args!("build succeeded ({} outputs)", outputs.len()));
            BuildState::Succeeded {
                event_log,
                outputs,
                resolved_image,
            }
        }
        Err(e) => {
            log_build_line(&workspace, format_args!("build failed: {e}"));
            BuildState::Failed {
                event_log,
                status_code: e.status_code(),
                error: e.to_string(),
            }
        }
    };
}

/// Run the serve step's container against the build's resolved image,
/// transitioning `Succeeded -> Serving` on success or `-> Failed` on error.
fn run_serve(
    state: Arc<Mutex<BuildState>>,
    runtime: Arc<dyn ContainerRuntime>,
    workspace: PathBuf,
    resolved_image: String,
    request: ServeRequest,
) {
    let (event_log, outputs) = match &*state.lock().expect("builder state mutex poisoned") {
        BuildState::Succeeded { event_log, outputs, .. } => (event_log.clone(), outputs.clone()),
        _ => return,
    };

    log_build_line(&workspace, "running serve container");
    let result = runtime.run(&ContainerRun {
        image: resolved_image,
        command: crate::cmd::CmdLine::shell(request.command),
        workspace_host_path: workspace.to_string_lossy().into_owned(),
        env: Vec::new(),
        network_disabled: false,
        gpu: false,
        published_ports: request.ports,
    });

    let mut guard = state.lock().expect("builder state mutex poisoned");
    *guard = match result {
        Ok(_) => {
            log_build_line(&workspace, "now serving");
            BuildState::Serving { event_log, outputs }
        }
        Err(e) => {
            let error: BuildError = e.into();
            log_build_line(&workspace, format_args!("serve failed: {error}"));
            BuildState::Failed {
                event_log,
                status_code: error.status_code(),
                error: error.to_string(),
            }
        }
    };
}

/// Enumerate the build's declared outputs (spec §4.3: `outputs: glob
/// pattern`), each recorded with its content hash.
pub(crate) fn collect_outputs(
    workspace: &PathBuf,
    pattern: &str,
) -> Result<Vec<OutputFile>, BuildError> {
    let full_pattern = workspace.join(pattern);
    let entries = glob::glob(&full_pattern.to_string_lossy())
        .map_err(|e| BuildError::Internal(format!("invalid output pattern: {e}")))?;

    let mut outputs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BuildError::Internal(e.to_string()))?;
        if !path.is_file() {
            continue;
        }
        let relative = path
            .strip_prefix(workspace)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let bytes = std::fs::read(&path)
            .map_err(|e| BuildError::Internal(format!("reading output {relative}: {e}")))?;
        outputs.push(OutputFile {
            path: relative,
            sha256: hex::encode(Sha256::digest(bytes)),
        });
    }
    outputs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(outputs)
}
