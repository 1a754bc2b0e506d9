//! Error taxonomy for the measured-build attestation pipeline (spec §7).
//!
//! One typed error per pipeline stage so callers (the HTTP shell, `poll()`,
//! the verifier) can match on the kind rather than grep a message string.

use thiserror::Error;

/// Errors rejected before any side effect or event-log mutation occurs.
///
/// Surfaced as 4xx to an HTTP caller; never appended to the event log.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("install_path must be relative and may not escape the workspace: {0}")]
    AbsoluteOrEscapingPath(String),

    #[error("malformed build request: {0}")]
    MalformedRequest(String),

    #[error("build already submitted")]
    AlreadySubmitted,

    #[error("axolotl configuration already registered")]
    AlreadyConfigured,

    #[error("finetune requires a previously registered configuration")]
    NotConfigured,

    #[error("serve step requires a completed build (current state: {0})")]
    NotServeReady(String),

    #[error("output pattern must not be absolute: {0}")]
    AbsoluteOutputPattern(String),

    #[error("requested output not found: {0}")]
    OutputNotFound(String),
}

impl ProtocolError {
    /// Maps a protocol error to the HTTP status the runner's thin shell
    /// surfaces it as (spec §6's endpoint table: 409 on double-submit,
    /// 406 on double-configure, 403 on an absolute/escaping path, 404 on a
    /// missing output).
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolError::AbsoluteOrEscapingPath(_) => 403,
            ProtocolError::AbsoluteOutputPattern(_) => 403,
            ProtocolError::MalformedRequest(_) => 400,
            ProtocolError::AlreadySubmitted => 409,
            ProtocolError::AlreadyConfigured => 406,
            ProtocolError::NotConfigured => 400,
            ProtocolError::NotServeReady(_) => 409,
            ProtocolError::OutputNotFound(_) => 404,
        }
    }
}

/// A [`crate::cmd::CmdLine`] argument violated the composer's quoting
/// invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CmdLineError {
    #[error("argument cannot contain a single quote: {0:?}")]
    UnquotableArgument(String),
}

/// Errors raised while resolving a declared build input (spec §4.5).
#[derive(Error, Debug)]
pub enum ResourceFetchError {
    #[error("fetch failed for resource at {install_path}: {reason}")]
    FetchFailed { install_path: String, reason: String },

    #[error("content-hash verification failed for {install_path}: expected {expected}, got {actual}")]
    HashMismatch {
        install_path: String,
        expected: String,
        actual: String,
    },

    #[error("extraction failed for {install_path}: {reason}")]
    ExtractionFailed { install_path: String, reason: String },

    #[error(
        "lockfile regeneration requires a pre-existing lockfile or lockfile source at {install_path}"
    )]
    MissingLockfileSource { install_path: String },
}

/// A containerized build step exited non-zero (spec §4.4).
#[derive(Error, Debug)]
#[error("build step failed in image {image} (exit code {exit_code:?}): {output}")]
pub struct ContainerRunError {
    pub image: String,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// The TPM gateway failed. Fatal: the build cannot proceed without
/// measurement, and a bundle must never be returned on this path.
#[derive(Error, Debug)]
pub enum TpmError {
    #[error("TPM communication failed: {0}")]
    CommunicationFailed(String),

    #[error("PCR extend failed for PCR {pcr}: {reason}")]
    ExtendFailed { pcr: u8, reason: String },

    #[error("PCR read failed for PCR {pcr}: {reason}")]
    ReadFailed { pcr: u8, reason: String },

    #[error("NV read failed for index {index}: {reason}")]
    NvReadFailed { index: String, reason: String },

    #[error("quote generation failed: {0}")]
    QuoteFailed(String),

    #[error("AK certificate chain retrieval failed: {0}")]
    CertChainFailed(String),
}

/// Top-level error produced by a build run, captured on the `Builder` and
/// re-raised from `poll()` (propagation rule in spec §7).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    ResourceFetch(#[from] ResourceFetchError),

    #[error(transparent)]
    ContainerRun(#[from] ContainerRunError),

    #[error(transparent)]
    Tpm(#[from] TpmError),

    #[error("no files matched output pattern: {0}")]
    NoOutputs(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Maps a build error to the HTTP status the runner's thin shell
    /// surfaces it as (spec §7: "Terminates the build; surfaced as
    /// 404/5xx on the next poll").
    pub fn status_code(&self) -> u16 {
        match self {
            BuildError::Protocol(e) => e.status_code(),
            BuildError::ResourceFetch(_) => 404,
            BuildError::ContainerRun(_) => 500,
            BuildError::Tpm(_) => 500,
            BuildError::NoOutputs(_) => 404,
            BuildError::Internal(_) => 500,
        }
    }
}

/// Errors the verifier can return, each naming the first failed check.
/// Later checks are never attempted once one of these is returned
/// (spec §4.8, §7, §8 "Bad chain" scenario).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("bundle is in simulation mode but verifier does not accept simulated bundles")]
    SimulationMismatch,

    #[error("certificate chain does not validate to the vendor root: {0}")]
    InvalidCertChain(String),

    #[error("quote signature or structure is invalid: {0}")]
    InvalidQuote(String),

    #[error(
        "platform PCR values do not match the expected boot profile (PCR {pcr}): expected {expected}, got {actual}"
    )]
    UnexpectedPlatformState {
        pcr: u8,
        expected: String,
        actual: String,
    },

    #[error("replaying the event log does not reproduce the measurement PCR in the quote")]
    EventLogMismatch,

    #[error("image {image} does not match its expected content identifier: expected {expected}, got {actual}")]
    UnexpectedImageDigest {
        image: String,
        expected: String,
        actual: String,
    },

    #[error("certificate-binding PCR does not match SHA256(0x00*32 || SHA256(ca_cert))")]
    TlsBindingMismatch,

    #[error("bundle is structurally invalid: {0}")]
    MalformedBundle(String),
}
