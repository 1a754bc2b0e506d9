//! Platform configuration: the handful of constants spec §9's Open Questions
//! name as platform-specific (AK handle, AK-cert NV index, PCR selection,
//! vendor root URL). Loaded the way the teacher loads `SentinelConfig` —
//! `serde`-derived, defaulted, overridable from a JSON file or environment.

use serde::{Deserialize, Serialize};

/// Measurement PCR used by the Event Log (spec §3, §4.2).
pub const DEFAULT_MEASUREMENT_PCR: u8 = 16;

/// Certificate-binding PCR used by the aTLS variant (spec §4.7, §9).
/// Distinct from the measurement PCR by construction.
pub const DEFAULT_CERT_BINDING_PCR: u8 = 15;

/// Default AK key-context handle (matches the original implementation).
pub const DEFAULT_AK_KEY_HANDLE: &str = "0x81000003";

/// Default AK-certificate NV index (matches the original implementation).
pub const DEFAULT_AK_CERT_NV_INDEX: &str = "0x01C101D0";

/// Default vendor root certificate fetch URL (Microsoft AME Root, matching
/// the original implementation's `verify.py`/`tpm.py`).
pub const DEFAULT_VENDOR_ROOT_URL: &str =
    "http://crl.microsoft.com/pkiinfra/certs/AMERoot_ameroot.crt";

/// Default vendor intermediate certificate fetch URL.
pub const DEFAULT_VENDOR_INTERMEDIATE_URL: &str =
    "http://crl.microsoft.com/pkiinfra/Certs/BL2PKIINTCA01.AME.GBL_AME%20Infra%20CA%2002(4).crt";

/// Bundled vendor root certificate (DER), embedded so verification can run
/// fully offline even if the network fetch above is unavailable. This is a
/// placeholder slot populated at deployment time with the real vendor root;
/// ship an empty slice here rather than fabricate certificate bytes.
pub static BUNDLED_VENDOR_ROOT_DER: &[u8] = include_bytes!("../assets/vendor_root.der");

/// Platform-specific constants the TPM Gateway and Attestation Assembler
/// need (spec §4.1, §9 Open Questions). All fields are overridable so a
/// different platform vendor can be plugged in without touching code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Whether TPM calls are skipped (spec §4.2, §9: "first-class mode").
    pub simulation_mode: bool,
    /// PCR index the Event Log extends on every append.
    pub measurement_pcr: u8,
    /// PCR index the aTLS variant extends at most once.
    pub cert_binding_pcr: u8,
    /// Full PCR selection included in a quote (spec: "all the PCRs").
    pub pcr_selection: Vec<u8>,
    /// TPM2 key-context handle for the attestation key.
    pub ak_key_handle: String,
    /// TPM2 NV index holding the AK certificate.
    pub ak_cert_nv_index: String,
    /// URL used to fetch the vendor intermediate certificate.
    pub vendor_intermediate_url: String,
    /// URL used to fetch the vendor root certificate.
    pub vendor_root_url: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            simulation_mode: false,
            measurement_pcr: DEFAULT_MEASUREMENT_PCR,
            cert_binding_pcr: DEFAULT_CERT_BINDING_PCR,
            pcr_selection: (0..=23).collect(),
            ak_key_handle: DEFAULT_AK_KEY_HANDLE.to_string(),
            ak_cert_nv_index: DEFAULT_AK_CERT_NV_INDEX.to_string(),
            vendor_intermediate_url: DEFAULT_VENDOR_INTERMEDIATE_URL.to_string(),
            vendor_root_url: DEFAULT_VENDOR_ROOT_URL.to_string(),
        }
    }
}

impl PlatformConfig {
    /// Load from a JSON file, falling back to defaults for any field the
    /// file omits. Environment variable `AICERT_SIMULATION_MODE` (presence,
    /// not value, matching the original implementation) forces simulation
    /// mode regardless of what the file says.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw)?
            }
            _ => PlatformConfig::default(),
        };
        if std::env::var_os("AICERT_SIMULATION_MODE").is_some() {
            config.simulation_mode = true;
        }
        Ok(config)
    }
}

/// Top-level runner configuration: platform constants plus the workspace
/// root and HTTP bind address. Analogous in spirit to the teacher's
/// `SentinelConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub platform: PlatformConfig,
    pub workspace: std::path::PathBuf,
    pub bind_addr: String,
    /// DER-encoded CA certificate bound into the certificate-binding PCR by
    /// `GET /aTLS` (spec §4.7, §9). `None` means the aTLS endpoint is not
    /// available on this deployment.
    #[serde(default)]
    pub tls_ca_cert_path: Option<std::path::PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            workspace: std::path::PathBuf::from("/workspace"),
            bind_addr: "0.0.0.0:80".to_string(),
            tls_ca_cert_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_measurement_and_binding_pcrs_are_distinct() {
        let cfg = PlatformConfig::default();
        assert_ne!(cfg.measurement_pcr, cfg.cert_binding_pcr);
    }

    #[test]
    fn default_pcr_selection_covers_all_24_registers() {
        let cfg = PlatformConfig::default();
        assert_eq!(cfg.pcr_selection.len(), 24);
        assert_eq!(cfg.pcr_selection.first(), Some(&0));
        assert_eq!(cfg.pcr_selection.last(), Some(&23));
    }
}
