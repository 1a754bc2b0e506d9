//! Wire request/response types for the runner's HTTP surface (spec §6),
//! grounded on the original implementation's pydantic models
//! (`common/aicert_common/protocol.py`).

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::resource::Resource;
use crate::wire::Base64Bytes;

/// A submitted build (spec §4.3, §6 `POST /build`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    pub output_pattern: String,
    #[serde(default)]
    pub gpu: bool,
}

/// A serve step (spec §4.6, §6 `POST /submit_serve`): reuses the completed
/// build's resolved image with a different command and published ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeRequest {
    pub command: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// An Axolotl training configuration (spec §4.6 `POST /axolotl/configuration`).
/// Carried as an opaque YAML document: the runner never interprets its
/// contents beyond handing it to the training container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxolotlConfig {
    pub yaml: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// The attestation bundle returned from `GET /attestation` (and, with
/// `ca_cert` populated, `GET /aTLS`). Every opaque byte field is wire-coded
/// via [`Base64Bytes`] (spec §6, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationBundle {
    pub simulation_mode: bool,
    pub event_log: Vec<Event>,
    pub quote_message: Base64Bytes,
    pub quote_signature: Base64Bytes,
    pub quote_pcr_dump: Base64Bytes,
    pub ak_cert_chain: Vec<Base64Bytes>,
    /// Present only for the aTLS variant: the CA certificate whose hash
    /// was bound into the certificate-binding PCR.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ca_cert: Option<Base64Bytes>,
}

/// One entry in the `outputs` listing (spec §6 `GET /outputs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFileDescriptor {
    pub path: String,
    pub sha256: String,
}
