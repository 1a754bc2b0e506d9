//! TPM Gateway (spec §4.1, component C1).
//!
//! Wraps the local TPM: read/extend a PCR, read an NV index, and produce a
//! quote signed by a named attestation key. Mirrors the teacher's
//! trait-contract pattern for hardware boundaries
//! (`hal::attestation::HardwareAttestation`, `hal::hsm::HardwareSecurityModule`):
//! a narrow trait, opaque blobs, fail-closed on any platform I/O error.

pub mod quote;
pub mod simulated;
pub mod tools;

use crate::error::TpmError;

pub use quote::ParsedQuote;
pub use simulated::SimulatedTpmGateway;
pub use tools::Tpm2ToolsGateway;

/// Hash algorithm for a PCR bank. Only SHA-256 is used by this system; the
/// type exists so a future bank selection is not a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

/// A signed attestation over a PCR selection. Fields are opaque byte blobs
/// per spec §4.1 ("the gateway never exposes the raw quote parser") — only
/// the Verifier parses them, via [`quote::parse`].
#[derive(Debug, Clone)]
pub struct Quote {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
    pub pcr_dump: Vec<u8>,
}

/// TPM Gateway contract (spec §4.1).
pub trait TpmGateway: Send + Sync {
    /// Read PCR `index` from the SHA-256 bank, normalized to lowercase hex
    /// with no `0x` prefix.
    fn read_pcr(&self, index: u8) -> Result<String, TpmError>;

    /// Atomically extend PCR `index` with `hex_digest` (lowercase hex, no
    /// prefix). Atomic with respect to other extends on the same gateway.
    fn extend_pcr(&self, index: u8, hex_digest: &str) -> Result<(), TpmError>;

    /// Read raw bytes from an NV index (e.g. the AK certificate slot).
    fn read_nv(&self, handle: &str) -> Result<Vec<u8>, TpmError>;

    /// Produce a quote over `pcr_selection`, signed by `key_handle`.
    fn quote(&self, key_handle: &str, pcr_selection: &[u8]) -> Result<Quote, TpmError>;

    /// True for [`SimulatedTpmGateway`] — lets the Event Log and Attestation
    /// Assembler know to set `simulation_mode` on the emitted bundle instead
    /// of calling through to hardware (spec §4.2, §4.7, §9).
    fn is_simulated(&self) -> bool;
}
