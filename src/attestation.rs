//! Attestation Assembler (spec §4.7, §4.9, component C7): turns a
//! completed build's event log plus a fresh TPM quote into the bundle an
//! offline verifier can check. Also implements the aTLS variant: binding
//! a CA certificate into a dedicated PCR exactly once per runner lifetime
//! (spec §9, grounded on the original implementation's `get_caddy_rootca`
//! / `/aTLS` endpoint in `server/aicert_server/aicert_server/main.py`,
//! which extends `PCR_FOR_CERTIFICATE` only if it currently reads zero).

use sha2::{Digest, Sha256};

use crate::config::{PlatformConfig, BUNDLED_VENDOR_ROOT_DER};
use crate::error::BuildError;
use crate::event::EventLog;
use crate::protocol::AttestationBundle;
use crate::tpm::TpmGateway;
use crate::wire::Base64Bytes;

/// Assemble a bundle from `event_log`'s current contents and a quote
/// fetched live from `gateway`. In simulation mode the quote and
/// certificate chain are left empty and `simulation_mode` is set, rather
/// than fabricating hardware evidence that doesn't exist (spec §9).
pub fn assemble(
    gateway: &dyn TpmGateway,
    platform: &PlatformConfig,
    event_log: &EventLog,
) -> Result<AttestationBundle, BuildError> {
    let events = event_log.snapshot();

    if gateway.is_simulated() {
        return Ok(AttestationBundle {
            simulation_mode: true,
            event_log: events,
            quote_message: Base64Bytes::default(),
            quote_signature: Base64Bytes::default(),
            quote_pcr_dump: Base64Bytes::default(),
            ak_cert_chain: Vec::new(),
            ca_cert: None,
        });
    }

    let quote = gateway.quote(&platform.ak_key_handle, &platform.pcr_selection)?;
    let ak_cert = gateway.read_nv(&platform.ak_cert_nv_index)?;
    let intermediate = fetch_vendor_cert(&platform.vendor_intermediate_url)?;
    // Fall back to the bundled vendor root if the live fetch is
    // unavailable, so assembly (and later, offline verification) doesn't
    // depend on network reachability at attestation time.
    let root = fetch_vendor_cert(&platform.vendor_root_url)
        .unwrap_or_else(|_| BUNDLED_VENDOR_ROOT_DER.to_vec());

    Ok(AttestationBundle {
        simulation_mode: false,
        event_log: events,
        quote_message: quote.message.into(),
        quote_signature: quote.signature.into(),
        quote_pcr_dump: quote.pcr_dump.into(),
        ak_cert_chain: vec![ak_cert.into(), intermediate.into(), root.into()],
        ca_cert: None,
    })
}

/// Extend the certificate-binding PCR with `SHA256(ca_cert_der)`, but only
/// the first time this is called for a given runner lifetime — re-running
/// it against an already-bound PCR would silently change what the PCR
/// attests to.
pub fn ensure_tls_binding(
    gateway: &dyn TpmGateway,
    platform: &PlatformConfig,
    ca_cert_der: &[u8],
) -> Result<(), BuildError> {
    let zero = hex::encode([0u8; 32]);
    let current = gateway.read_pcr(platform.cert_binding_pcr)?;
    if current == zero {
        let digest = hex::encode(Sha256::digest(ca_cert_der));
        gateway.extend_pcr(platform.cert_binding_pcr, &digest)?;
    }
    Ok(())
}

/// The aTLS variant of [`assemble`]: binds `ca_cert_der` into the
/// certificate-binding PCR (idempotently) and includes it in the bundle
/// so a caller can verify `TlsBindingMismatch` offline (spec §4.8).
pub fn assemble_atls(
    gateway: &dyn TpmGateway,
    platform: &PlatformConfig,
    event_log: &EventLog,
    ca_cert_der: &[u8],
) -> Result<AttestationBundle, BuildError> {
    ensure_tls_binding(gateway, platform, ca_cert_der)?;
    let mut bundle = assemble(gateway, platform, event_log)?;
    bundle.ca_cert = Some(ca_cert_der.to_vec().into());
    Ok(bundle)
}

fn fetch_vendor_cert(url: &str) -> Result<Vec<u8>, BuildError> {
    let response = reqwest::blocking::get(url)
        .map_err(|e| BuildError::Internal(format!("fetching vendor certificate {url}: {e}")))?;
    let bytes = response
        .bytes()
        .map_err(|e| BuildError::Internal(format!("reading vendor certificate {url}: {e}")))?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::SimulatedTpmGateway;
    use std::sync::Arc;

    #[test]
    fn simulated_bundle_carries_no_hardware_evidence() {
        let gateway = SimulatedTpmGateway::new();
        let platform = PlatformConfig::default();
        let log = EventLog::new(Arc::new(SimulatedTpmGateway::new()), platform.measurement_pcr);
        let bundle = assemble(&gateway, &platform, &log).unwrap();
        assert!(bundle.simulation_mode);
        assert!(bundle.ak_cert_chain.is_empty());
    }

    #[test]
    fn tls_binding_is_idempotent() {
        let gateway = SimulatedTpmGateway::new();
        let platform = PlatformConfig::default();
        let ca_cert = b"fake-ca-cert-der";

        ensure_tls_binding(&gateway, &platform, ca_cert).unwrap();
        let after_first = gateway.read_pcr(platform.cert_binding_pcr).unwrap();

        ensure_tls_binding(&gateway, &platform, ca_cert).unwrap();
        let after_second = gateway.read_pcr(platform.cert_binding_pcr).unwrap();

        assert_eq!(after_first, after_second);
        assert_ne!(after_first, hex::encode([0u8; 32]));
    }
}
