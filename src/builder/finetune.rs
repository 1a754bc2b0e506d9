//! Finetune variant (spec §4.6, §9): a parallel single-shot background
//! task that trains an Axolotl configuration in a network-disabled GPU
//! container, times the run, and packages the LoRA adapter. Grounded on
//! the original implementation's `__axolotl_run`/`__finetune_fn` and
//! `start_finetune`/`poll_finetune` (`server/aicert_server/aicert_server/builder.py`).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::builder::fetch_and_record_resource;
use crate::cmd::CmdLine;
use crate::config::PlatformConfig;
use crate::container::{ContainerRun, ContainerRuntime, ImageCache};
use crate::error::{BuildError, ProtocolError};
use crate::event::EventLog;
use crate::protocol::AxolotlConfig;
use crate::resource::validate_install_path;
use crate::tpm::TpmGateway;

/// Image the training step runs in. Offline-only: the original
/// implementation forces `HF_DATASETS_OFFLINE=1`/`TRANSFORMERS_OFFLINE=1`
/// so a finetune run cannot silently reach out for data it wasn't given
/// as a declared resource.
const TRAINING_IMAGE: &str = "winglian/axolotl:main-latest";

const CONFIG_FILE_NAME: &str = "axolotl_config.yaml";
const LORA_OUTPUT_DIR: &str = "lora-out";
const ZIP_OUTPUT_NAME: &str = "finetuned-model.zip";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinetuneStatus {
    Idle,
    Running,
    Succeeded { output: String, sha256: String },
    Failed { error: String, status_code: u16 },
}

enum FinetuneState {
    Idle,
    Configured { config: AxolotlConfig },
    Running,
    Succeeded { output_path: String, sha256: String },
    Failed { error: String, status_code: u16 },
}

pub struct FinetuneRunner {
    gateway: Arc<dyn TpmGateway>,
    runtime: Arc<dyn ContainerRuntime>,
    platform: PlatformConfig,
    workspace: PathBuf,
    image_cache: Arc<ImageCache>,
    event_log: Arc<EventLog>,
    state: Arc<Mutex<FinetuneState>>,
}

impl FinetuneRunner {
    pub fn new(
        gateway: Arc<dyn TpmGateway>,
        runtime: Arc<dyn ContainerRuntime>,
        platform: PlatformConfig,
        workspace: PathBuf,
        image_cache: Arc<ImageCache>,
    ) -> Self {
        let event_log = Arc::new(EventLog::new(gateway.clone(), platform.measurement_pcr));
        Self {
            gateway,
            runtime,
            platform,
            workspace,
            image_cache,
            event_log,
            state: Arc::new(Mutex::new(FinetuneState::Idle)),
        }
    }

    /// Register an Axolotl configuration (spec §6 `POST /axolotl/configuration`),
    /// recording a `configuration` event immediately — the original
    /// implementation's `__register_axolotl_config` hashes the config file
    /// and appends the event at registration time, not at run-start time,
    /// so the event log reflects what was submitted even if the run is
    /// never started.
    pub fn register_config(&self, config: AxolotlConfig) -> Result<(), ProtocolError> {
        let mut guard = self.state.lock().expect("finetune state mutex poisoned");
        if !matches!(*guard, FinetuneState::Idle) {
            return Err(ProtocolError::AlreadyConfigured);
        }
        // Reject a structurally malformed config before it's measured —
        // the runner never interprets the YAML beyond this well-formedness
        // check, but a syntax error caught here is a 400, not a training
        // container crash an hour into the run.
        serde_yaml::from_str::<serde_yaml::Value>(&config.yaml)
            .map_err(|e| ProtocolError::MalformedRequest(format!("axolotl config is not valid YAML: {e}")))?;
        let hash = hex::encode(Sha256::digest(config.yaml.as_bytes()));
        self.event_log
            .configuration(CONFIG_FILE_NAME, format!("sha256:{hash}"))
            .map_err(|_| ProtocolError::AlreadyConfigured)?;
        *guard = FinetuneState::Configured { config };
        Ok(())
    }

    /// Start the finetune run against the registered configuration. Rejects
    /// a second start the same way `Builder::submit` rejects a second build
    /// (spec §4.6: "single-shot, independent of the build's own single-shot
    /// guard"), and rejects starting before a configuration is registered.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let mut guard = self.state.lock().expect("finetune state mutex poisoned");
        let config = match &*guard {
            FinetuneState::Configured { config } => config.clone(),
            FinetuneState::Idle => return Err(ProtocolError::NotConfigured),
            _ => return Err(ProtocolError::AlreadySubmitted),
        };
        *guard = FinetuneState::Running;
        drop(guard);

        let state = self.state.clone();
        let runtime = self.runtime.clone();
        let image_cache = self.image_cache.clone();
        let workspace = self.workspace.clone();
        let event_log = self.event_log.clone();

        thread::spawn(move || {
            run_finetune(state, event_log, runtime, image_cache, workspace, config);
        });

        Ok(())
    }

    pub fn status(&self) -> FinetuneStatus {
        match &*self.state.lock().expect("finetune state mutex poisoned") {
            FinetuneState::Idle | FinetuneState::Configured { .. } => FinetuneStatus::Idle,
            FinetuneState::Running => FinetuneStatus::Running,
            FinetuneState::Succeeded { output_path, sha256 } => FinetuneStatus::Succeeded {
                output: output_path.clone(),
                sha256: sha256.clone(),
            },
            FinetuneState::Failed { error, status_code } => FinetuneStatus::Failed {
                error: error.clone(),
                status_code: *status_code,
            },
        }
    }

    /// The finetune run's event log, available from the moment a
    /// configuration is registered (spec §9: the `configuration` event
    /// must be visible even before the run starts).
    pub fn event_log(&self) -> Arc<EventLog> {
        self.event_log.clone()
    }
}

fn run_finetune(
    state: Arc<Mutex<FinetuneState>>,
    event_log: Arc<EventLog>,
    runtime: Arc<dyn ContainerRuntime>,
    image_cache: Arc<ImageCache>,
    workspace: PathBuf,
    config: AxolotlConfig,
) {
    let result = (|| -> Result<(String, String), BuildError> {
        std::fs::write(workspace.join(CONFIG_FILE_NAME), &config.yaml)
            .map_err(|e| BuildError::Internal(format!("writing axolotl config: {e}")))?;

        for resource in &config.resources {
            validate_install_path(resource.install_path())?;
        }
        for resource in &config.resources {
            fetch_and_record_resource(resource, runtime.as_ref(), &image_cache, &workspace, &event_log)?;
        }

        let (digest, first_time) = image_cache.resolve_once(runtime.as_ref(), TRAINING_IMAGE)?;
        if first_time {
            event_log.input_image(format!("{TRAINING_IMAGE}@{digest}"))?;
        }

        let started_at = Instant::now();
        runtime.run(&ContainerRun {
            image: TRAINING_IMAGE.to_string(),
            command: CmdLine::shell(format!(
                "accelerate launch -m axolotl.cli.train {CONFIG_FILE_NAME}"
            )),
            workspace_host_path: workspace.to_string_lossy().into_owned(),
            env: vec![
                ("HF_DATASETS_OFFLINE".to_string(), "1".to_string()),
                ("TRANSFORMERS_OFFLINE".to_string(), "1".to_string()),
            ],
            network_disabled: true,
            gpu: true,
            published_ports: Vec::new(),
        })?;
        let elapsed = started_at.elapsed().as_secs_f64();
        event_log.finetune_timing(elapsed)?;

        let total_flos = read_total_flos(&workspace)?;
        event_log.finetune_flops(total_flos)?;

        let zip_path = workspace.join(ZIP_OUTPUT_NAME);
        package_lora_output(&workspace, &zip_path)?;

        let bytes = std::fs::read(&zip_path)
            .map_err(|e| BuildError::Internal(format!("reading {ZIP_OUTPUT_NAME}: {e}")))?;
        let sha256 = hex::encode(Sha256::digest(bytes));
        event_log.outputs(vec![crate::event::OutputFile {
            path: ZIP_OUTPUT_NAME.to_string(),
            sha256: sha256.clone(),
        }])?;

        Ok((ZIP_OUTPUT_NAME.to_string(), sha256))
    })();

    let mut guard = state.lock().expect("finetune state mutex poisoned");
    *guard = match result {
        Ok((output_path, sha256)) => FinetuneState::Succeeded { output_path, sha256 },
        Err(e) => FinetuneState::Failed {
            status_code: e.status_code(),
            error: e.to_string(),
        },
    };
}

/// Extract `total_flos` from the training container's `trainer_state.json`
/// (the file HuggingFace's `Trainer` writes into its output directory).
fn read_total_flos(workspace: &PathBuf) -> Result<f64, BuildError> {
    let path = workspace.join(LORA_OUTPUT_DIR).join("trainer_state.json");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| BuildError::Internal(format!("reading trainer_state.json: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| BuildError::Internal(format!("parsing trainer_state.json: {e}")))?;
    value
        .get("total_flos")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| BuildError::Internal("trainer_state.json has no total_flos field".to_string()))
}

/// Zip the training container's `lora-out/` directory into a single
/// artifact, the way the original implementation's `zipfile` packaging
/// step does.
fn package_lora_output(workspace: &PathBuf, zip_path: &std::path::Path) -> Result<(), BuildError> {
    let source_dir = workspace.join(LORA_OUTPUT_DIR);
    let file = std::fs::File::create(zip_path)
        .map_err(|e| BuildError::Internal(format!("creating {ZIP_OUTPUT_NAME}: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(&source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&source_dir)
            .expect("walkdir entries are under source_dir")
            .to_string_lossy()
            .into_owned();
        writer
            .start_file(&relative, options)
            .map_err(|e| BuildError::Internal(format!("zipping {relative}: {e}")))?;
        let bytes = std::fs::read(entry.path())
            .map_err(|e| BuildError::Internal(format!("reading {relative}: {e}")))?;
        std::io::Write::write_all(&mut writer, &bytes)
            .map_err(|e| BuildError::Internal(format!("writing {relative} to zip: {e}")))?;
    }

    writer
        .finish()
        .map_err(|e| BuildError::Internal(format!("finalizing {ZIP_OUTPUT_NAME}: {e}")))?;
    Ok(())
}
