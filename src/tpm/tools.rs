//! Real TPM Gateway: shells out to the `tpm2-tools` CLI, matching the
//! original implementation's `subprocess.run(["tpm2_...`, ...])` calls in
//! `server/aicert_server/tpm.py` one-for-one. Process spawning here follows
//! the teacher's own idiom for talking to anything outside the process
//! boundary (see `main.rs`'s child-process supervision).

use std::io::Write as _;
use std::process::Command;

use super::{Quote, TpmGateway};
use crate::error::TpmError;

/// Talks to a local TPM 2.0 through `tpm2-tools` binaries on `PATH`.
pub struct Tpm2ToolsGateway;

impl Tpm2ToolsGateway {
    pub fn new() -> Self {
        Self
    }

    fn run(cmd: &mut Command) -> Result<std::process::Output, TpmError> {
        cmd.output()
            .map_err(|e| TpmError::CommunicationFailed(e.to_string()))
    }
}

impl Default for Tpm2ToolsGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmGateway for Tpm2ToolsGateway {
    fn read_pcr(&self, index: u8) -> Result<String, TpmError> {
        let output = Self::run(Command::new("tpm2_pcrread").arg(format!("sha256:{index}")))?;
        if !output.status.success() {
            return Err(TpmError::ReadFailed {
                pcr: index,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // tpm2_pcrread emits YAML of the form:
        //   sha256:
        //     16: 0x0000...
        parse_pcrread_yaml(&stdout, index)
    }

    fn extend_pcr(&self, index: u8, hex_digest: &str) -> Result<(), TpmError> {
        let output = Self::run(
            Command::new("tpm2_pcrextend").arg(format!("{index}:sha256={hex_digest}")),
        )?;
        if !output.status.success() {
            return Err(TpmError::ExtendFailed {
                pcr: index,
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    fn read_nv(&self, handle: &str) -> Result<Vec<u8>, TpmError> {
        let output = Self::run(Command::new("tpm2_nvread").arg("-Co").arg(handle))?;
        if !output.status.success() {
            return Err(TpmError::NvReadFailed {
                index: handle.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn quote(&self, key_handle: &str, pcr_selection: &[u8]) -> Result<Quote, TpmError> {
        let pcr_list = pcr_selection
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut msg_file = tempfile::NamedTempFile::new()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let mut sig_file = tempfile::NamedTempFile::new()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let mut pcr_file = tempfile::NamedTempFile::new()
            .map_err(|e| TpmError::QuoteFailed(e.to_string()))?;

        let output = Self::run(
            Command::new("tpm2_quote")
                .arg("--quiet")
                .arg("--key-context")
                .arg(key_handle)
                .arg("--pcr-list")
                .arg(format!("sha256:{pcr_list}"))
                .arg("--message")
                .arg(msg_file.path())
                .arg("--signature")
                .arg(sig_file.path())
                .arg("--pcr")
                .arg(pcr_file.path())
                .arg("--hash-algorithm")
                .arg("sha256"),
        )?;
        if !output.status.success() {
            return Err(TpmError::QuoteFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        // Flush is a no-op for reads, but keep the handles alive until we've
        // read them back so the temp files aren't removed early.
        msg_file.flush().ok();
        sig_file.flush().ok();
        pcr_file.flush().ok();

        let message =
            std::fs::read(msg_file.path()).map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let signature =
            std::fs::read(sig_file.path()).map_err(|e| TpmError::QuoteFailed(e.to_string()))?;
        let pcr_dump =
            std::fs::read(pcr_file.path()).map_err(|e| TpmError::QuoteFailed(e.to_string()))?;

        Ok(Quote {
            message,
            signature,
            pcr_dump,
        })
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Parses the subset of `tpm2_pcrread`'s YAML output this gateway needs,
/// without pulling in a YAML parser for three lines of text — mirrors the
/// normalization the original performs with `yaml.load(...).removeprefix("0x")`.
fn parse_pcrread_yaml(stdout: &str, index: u8) -> Result<String, TpmError> {
    let needle = format!("{index}:");
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&needle) {
            let hex_value = rest.trim().trim_start_matches("0x").trim_start_matches("0X");
            return Ok(hex_value.to_lowercase());
        }
    }
    Err(TpmError::ReadFailed {
        pcr: index,
        reason: format!("PCR {index} not present in tpm2_pcrread output"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pcrread_yaml_lowercases_and_strips_prefix() {
        let stdout = "sha256:\n  16: 0xABCDEF00\n";
        let value = parse_pcrread_yaml(stdout, 16).unwrap();
        assert_eq!(value, "abcdef00");
    }

    #[test]
    fn missing_pcr_is_an_error() {
        let stdout = "sha256:\n  15: 0x00\n";
        assert!(parse_pcrread_yaml(stdout, 16).is_err());
    }
}
