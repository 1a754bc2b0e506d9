//! Structured logging for the runner (spec §9's ambient-stack expansion):
//! every build/attestation-relevant transition emitted as a JSON event so
//! a deployment can ship it to whatever log pipeline it already runs.
//!
//! Grounded on the teacher's own `observability` module: a
//! `tracing`/`tracing-appender` non-blocking rolling-file subscriber,
//! generalized from the teacher's audit-trail vocabulary to this system's
//! events (build lifecycle, resource fetch, container run, event-log
//! append, attestation issuance, verification result).

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for the runner's log output.
pub struct LoggingConfig {
    /// Directory for rolling log files.
    pub log_dir: String,
    /// Base filename for logs (date is appended by the rolling appender).
    pub log_prefix: String,
    /// Also emit a pretty-printed copy to stdout, for interactive runs.
    pub console_output: bool,
    /// Log level filter (e.g. "info", "debug"); overridden by `RUST_LOG`.
    pub level_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_prefix: "aicert-runner".to_string(),
            console_output: true,
            level_filter: "info".to_string(),
        }
    }
}

/// Initialize the global tracing subscriber. Returns a [`WorkerGuard`]
/// that must be held for the process's lifetime — dropping it stops the
/// background writer thread and silently truncates the log.
pub fn init_tracing(config: LoggingConfig) -> WorkerGuard {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &config.log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level_filter));

    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if config.console_output {
        let console_layer = fmt::layer().pretty().with_writer(std::io::stdout).with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .with(console_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(json_layer).init();
    }

    guard
}

/// Initialize tracing with the default configuration.
pub fn init_tracing_default() -> WorkerGuard {
    init_tracing(LoggingConfig::default())
}

/// Names of the spec-relevant events this runner logs (spec §9): kept as
/// a closed vocabulary so a log pipeline can alert on specific names
/// rather than grepping free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerEvent {
    BuildSubmitted,
    BuildSucceeded,
    BuildFailed,
    ResourceFetched,
    ContainerRun,
    EventAppended,
    AttestationIssued,
    VerificationSucceeded,
    VerificationFailed,
}

impl std::fmt::Display for RunnerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunnerEvent::BuildSubmitted => "build_submitted",
            RunnerEvent::BuildSucceeded => "build_succeeded",
            RunnerEvent::BuildFailed => "build_failed",
            RunnerEvent::ResourceFetched => "resource_fetched",
            RunnerEvent::ContainerRun => "container_run",
            RunnerEvent::EventAppended => "event_appended",
            RunnerEvent::AttestationIssued => "attestation_issued",
            RunnerEvent::VerificationSucceeded => "verification_succeeded",
            RunnerEvent::VerificationFailed => "verification_failed",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_logging_config_matches_runner_naming() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_prefix, "aicert-runner");
        assert!(config.console_output);
    }

    #[test]
    fn runner_event_names_are_stable() {
        assert_eq!(RunnerEvent::BuildSubmitted.to_string(), "build_submitted");
        assert_eq!(RunnerEvent::VerificationFailed.to_string(), "verification_failed");
    }
}
