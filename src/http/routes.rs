//! Route handlers for the runner's external interface (spec §6). Each
//! handler is a thin adapter: decode the request, call one method on
//! [`Builder`], and map the `Result` to the status code spec §6 names.
//! Every call into the synchronous core happens on a blocking thread
//! (`tokio::task::spawn_blocking`, spec §5) so a slow TPM call or
//! container run never stalls the async reactor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::attestation;
use crate::builder::{Builder, BuildStatus};
use crate::error::{BuildError, ProtocolError};
use crate::protocol::{AttestationBundle, AxolotlConfig, BuildRequest, OutputFileDescriptor, ServeRequest};

/// Shared state every handler closes over: the single build runner and
/// the optional path to the CA certificate `GET /aTLS` binds into a PCR.
#[derive(Clone)]
pub struct AppState {
    pub builder: Arc<Builder>,
    pub tls_ca_cert_path: Option<PathBuf>,
}

/// Opaque JSON error body returned for every non-2xx response (spec §7:
/// callers match on HTTP status, not on message text).
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<ProtocolError> for ApiError {
    fn from(error: ProtocolError) -> Self {
        Self {
            status: StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
            message: error.to_string(),
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(error: BuildError) -> Self {
        Self {
            status: StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: error.to_string(),
        }
    }
}

/// Run a blocking closure on a worker thread and flatten the join error
/// into an [`ApiError`] (spec §5: the async shell never blocks on TPM or
/// container I/O).
async fn run_blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> Result<T, ApiError>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(inner) => inner.map_err(Into::into),
        Err(join_error) => Err(ApiError::internal(format!("worker thread panicked: {join_error}"))),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/submit_build", post(submit_build))
        .route("/submit_serve", post(submit_serve))
        .route("/finetune", post(start_finetune))
        .route("/axolotl/configuration", post(register_axolotl_configuration))
        .route("/attestation", get(get_attestation))
        .route("/outputs", get(list_outputs))
        .route("/outputs/*path", get(get_output_file))
        .route("/aTLS", get(get_atls))
        .route("/build/status", get(tail_build_status))
        .with_state(state)
}

async fn submit_build(
    State(state): State<AppState>,
    Json(request): Json<BuildRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || state.builder.submit(request)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn submit_serve(
    State(state): State<AppState>,
    Json(request): Json<ServeRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || state.builder.submit_serve(request)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn start_finetune(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    run_blocking(move || state.builder.start_finetune()).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn register_axolotl_configuration(
    State(state): State<AppState>,
    Json(config): Json<AxolotlConfig>,
) -> Result<StatusCode, ApiError> {
    run_blocking(move || state.builder.register_axolotl_config(config)).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /attestation`: 200 with the bundle once a build has produced one,
/// 204 while still running, and the build's own failure status otherwise
/// (spec §6, §7).
async fn get_attestation(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.builder.status() {
        BuildStatus::Idle | BuildStatus::Running => Ok(StatusCode::NO_CONTENT.into_response()),
        BuildStatus::Failed { status_code, error } => Err(ApiError {
            status: StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: error,
        }),
        BuildStatus::Succeeded | BuildStatus::Serving => {
            let builder = state.builder.clone();
            let bundle: AttestationBundle = run_blocking(move || -> Result<AttestationBundle, BuildError> {
                let event_log = builder.attestation_event_log().map_err(BuildError::from)?;
                attestation::assemble(builder.gateway().as_ref(), builder.platform(), &event_log)
            })
            .await?;
            Ok((StatusCode::OK, Json(bundle)).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct OutputsQuery {
    pattern: Option<String>,
}

/// `GET /outputs?pattern=...`: lists the build's declared outputs,
/// optionally filtered to those matching a glob pattern (spec §6: "403
/// on absolute pattern").
async fn list_outputs(
    State(state): State<AppState>,
    Query(query): Query<OutputsQuery>,
) -> Result<Json<Vec<OutputFileDescriptor>>, ApiError> {
    if let Some(pattern) = &query.pattern {
        if std::path::Path::new(pattern).is_absolute() {
            return Err(ProtocolError::AbsoluteOutputPattern(pattern.clone()).into());
        }
    }

    let pattern = query.pattern.clone();
    let outputs = run_blocking(move || state.builder.list_outputs()).await?;

    let outputs = match pattern {
        Some(pattern) => {
            let glob_pattern = glob::Pattern::new(&pattern)
                .map_err(|e| ProtocolError::MalformedRequest(e.to_string()))?;
            outputs
                .into_iter()
                .filter(|file| glob_pattern.matches(&file.path))
                .collect()
        }
        None => outputs,
    };
    Ok(Json(outputs))
}

/// `GET /outputs/<path>`: the raw bytes of one declared output (spec §6:
/// "404 on miss").
async fn get_output_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let bytes = run_blocking(move || state.builder.read_output(&path)).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

/// `GET /aTLS`: the aTLS variant of the attestation bundle, including the
/// bound `ca_cert` (spec §4.7, §6, §9). 404s on a deployment that never
/// configured a transport CA certificate.
async fn get_atls(State(state): State<AppState>) -> Result<Json<AttestationBundle>, ApiError> {
    let ca_cert_path = state
        .tls_ca_cert_path
        .clone()
        .ok_or_else(|| ApiError::not_found("aTLS is not configured on this deployment"))?;

    let builder = state.builder.clone();
    let bundle = run_blocking(move || -> Result<AttestationBundle, BuildError> {
        let ca_cert_der = std::fs::read(&ca_cert_path)
            .map_err(|e| BuildError::Internal(format!("reading TLS CA certificate: {e}")))?;
        let event_log = builder.attestation_event_log().map_err(BuildError::from)?;
        attestation::assemble_atls(builder.gateway().as_ref(), builder.platform(), &event_log, &ca_cert_der)
    })
    .await?;

    Ok(Json(bundle))
}

/// `GET /build/status`: tails the build's plain-text status log
/// (spec §6), polling the file with `tokio::fs` rather than a
/// file-watch crate, since the runner already knows exactly when to stop
/// (once the build leaves `Running`).
async fn tail_build_status(State(state): State<AppState>) -> Response {
    let log_path = state.builder.build_log_path();
    let builder = state.builder.clone();

    let body_stream = async_stream::stream! {
        let mut offset: u64 = 0;
        loop {
            match read_new_bytes(&log_path, offset).await {
                Ok(Some(chunk)) => {
                    offset += chunk.len() as u64;
                    yield Ok::<_, std::io::Error>(chunk);
                }
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
            if !matches!(builder.status(), BuildStatus::Running) {
                if let Ok(Some(chunk)) = read_new_bytes(&log_path, offset).await {
                    yield Ok(chunk);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(body_stream))
        .expect("static headers and streaming body always build a valid response")
}

/// Read whatever bytes were appended to `path` since `offset`, if any.
async fn read_new_bytes(path: &std::path::Path, offset: u64) -> std::io::Result<Option<axum::body::Bytes>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if metadata.len() <= offset {
        return Ok(None);
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity((metadata.len() - offset) as usize);
    file.read_to_end(&mut buf).await?;
    if buf.is_empty() {
        Ok(None)
    } else {
        Ok(Some(axum::body::Bytes::from(buf)))
    }
}
