//! Simulated TPM Gateway: an in-memory PCR bank used when
//! `simulation_mode` is configured (spec §4.2, §9: "a first-class mode,
//! not a debugging backdoor"). Mirrors the teacher's `NullAttestation`
//! pattern in `hal/attestation.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{Quote, TpmGateway};
use crate::error::TpmError;

const ZERO_PCR: [u8; 32] = [0u8; 32];

/// In-memory PCR bank. Every PCR starts at the all-zero value, matching a
/// freshly booted, unmeasured TPM.
pub struct SimulatedTpmGateway {
    pcrs: Mutex<HashMap<u8, [u8; 32]>>,
}

impl SimulatedTpmGateway {
    pub fn new() -> Self {
        Self {
            pcrs: Mutex::new(HashMap::new()),
        }
    }

    fn current(&self, index: u8) -> [u8; 32] {
        self.pcrs
            .lock()
            .expect("simulated PCR bank mutex poisoned")
            .get(&index)
            .copied()
            .unwrap_or(ZERO_PCR)
    }
}

impl Default for SimulatedTpmGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmGateway for SimulatedTpmGateway {
    fn read_pcr(&self, index: u8) -> Result<String, TpmError> {
        Ok(hex::encode(self.current(index)))
    }

    fn extend_pcr(&self, index: u8, hex_digest: &str) -> Result<(), TpmError> {
        let digest_bytes = hex::decode(hex_digest).map_err(|e| TpmError::ExtendFailed {
            pcr: index,
            reason: e.to_string(),
        })?;
        let mut pcrs = self.pcrs.lock().expect("simulated PCR bank mutex poisoned");
        let old = pcrs.get(&index).copied().unwrap_or(ZERO_PCR);
        let mut hasher = Sha256::new();
        hasher.update(old);
        hasher.update(&digest_bytes);
        let new: [u8; 32] = hasher.finalize().into();
        pcrs.insert(index, new);
        Ok(())
    }

    fn read_nv(&self, _handle: &str) -> Result<Vec<u8>, TpmError> {
        Ok(Vec::new())
    }

    fn quote(&self, _key_handle: &str, pcr_selection: &[u8]) -> Result<Quote, TpmError> {
        // Deterministic stub: no real hardware signature exists in
        // simulation mode. Simulated bundles skip the quote entirely at
        // the Attestation Assembler layer (`remote_attestation.simulation_mode`),
        // so this path only exists for gateways that want a Quote value to
        // hand around in tests.
        let mut message = Vec::new();
        for pcr in pcr_selection {
            message.extend_from_slice(&self.current(*pcr));
        }
        Ok(Quote {
            message,
            signature: Vec::new(),
            pcr_dump: Vec::new(),
        })
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let gw = SimulatedTpmGateway::new();
        assert_eq!(gw.read_pcr(16).unwrap(), hex::encode(ZERO_PCR));
    }

    #[test]
    fn extend_is_a_hash_chain() {
        let gw = SimulatedTpmGateway::new();
        let h0 = hex::encode(Sha256::digest(b"event-0"));
        gw.extend_pcr(16, &h0).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(ZERO_PCR);
        hasher.update(hex::decode(&h0).unwrap());
        let expected = hex::encode(hasher.finalize());

        assert_eq!(gw.read_pcr(16).unwrap(), expected);
    }

    #[test]
    fn unrelated_pcrs_stay_independent() {
        let gw = SimulatedTpmGateway::new();
        gw.extend_pcr(16, &hex::encode(Sha256::digest(b"a"))).unwrap();
        assert_eq!(gw.read_pcr(15).unwrap(), hex::encode(ZERO_PCR));
    }
}
