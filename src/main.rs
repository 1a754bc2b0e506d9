//! Runner binary: loads [`RunnerConfig`], wires the TPM gateway and
//! container runtime the configured mode calls for, and serves the HTTP
//! shell (spec §5, §6). Grounded on the teacher's `main.rs`: environment
//! driven configuration, `tracing`-backed logging held open for the
//! process's lifetime, graceful shutdown on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use aicert_runner::builder::Builder;
use aicert_runner::config::RunnerConfig;
use aicert_runner::container::DockerCliRuntime;
use aicert_runner::http::{self, AppState};
use aicert_runner::observability::{self, LoggingConfig};
use aicert_runner::tpm::{SimulatedTpmGateway, Tpm2ToolsGateway, TpmGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _tracing_guard = observability::init_tracing(LoggingConfig {
        console_output: std::env::var_os("AICERT_LOG_CONSOLE").is_some(),
        ..LoggingConfig::default()
    });

    info!(bind_addr = %config.bind_addr, simulation_mode = config.platform.simulation_mode, "starting measured-build runner");

    std::fs::create_dir_all(&config.workspace)
        .with_context(|| format!("creating workspace directory {}", config.workspace.display()))?;

    let gateway: Arc<dyn TpmGateway> = if config.platform.simulation_mode {
        Arc::new(SimulatedTpmGateway::new())
    } else {
        Arc::new(Tpm2ToolsGateway::new())
    };
    let runtime = Arc::new(DockerCliRuntime::new());

    let builder = Arc::new(Builder::new(
        gateway,
        runtime,
        config.platform.clone(),
        config.workspace.clone(),
    ));

    let app = http::router(AppState {
        builder,
        tls_ca_cert_path: config.tls_ca_cert_path.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(bind_addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server terminated unexpectedly")?;

    info!("shut down");
    Ok(())
}

/// Load [`RunnerConfig`] from the path named by `AICERT_CONFIG`, if set,
/// falling back to defaults. Mirrors [`aicert_runner::config::PlatformConfig::load`]'s
/// file-with-env-override pattern one level up.
fn load_config() -> anyhow::Result<RunnerConfig> {
    let mut config = match std::env::var_os("AICERT_CONFIG") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", std::path::Path::new(&path).display()))?;
            serde_json::from_str(&raw).context("parsing runner config")?
        }
        None => RunnerConfig::default(),
    };
    if std::env::var_os("AICERT_SIMULATION_MODE").is_some() {
        config.platform.simulation_mode = true;
    }
    if let Some(bind_addr) = std::env::var("AICERT_BIND_ADDR").ok() {
        config.bind_addr = bind_addr;
    }
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
