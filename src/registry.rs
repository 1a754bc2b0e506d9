//! Expected-Measurement Registry (spec §4.8 step 4, component C8): static,
//! deployment-time boot profiles the Verifier checks a quote's early-boot
//! PCRs against. Grounded on the original implementation's hardcoded
//! PCR 0-5 value asserts in `server/server/verify.py`'s `check_quote`,
//! generalized here into named, swappable profiles (spec §9 Open Question:
//! "a fleet with more than one firmware baseline needs more than one
//! row") the way the teacher keys its own static tables (e.g.
//! `hal::attestation::ExpectedBootChain`) by a platform identifier rather
//! than hardcoding one chain.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// The PCR range the original implementation hardcodes expectations for:
/// firmware, bootloader, and early OS measurements (PCR 16+ are left to
/// the Event Log's own measurement chain, not this registry).
pub const BOOT_MEASUREMENT_PCRS: std::ops::RangeInclusive<u8> = 0..=5;

/// A named boot profile: the lowercase hex PCR values a platform is
/// expected to present for [`BOOT_MEASUREMENT_PCRS`].
#[derive(Debug, Clone)]
pub struct BootProfile {
    pub name: &'static str,
    pub expected_pcrs: HashMap<u8, &'static str>,
}

lazy_static! {
    /// Known boot profiles, keyed by profile name (spec §9 resolves the
    /// Open Question "which profile applies" to: the caller names one
    /// explicitly via `RunnerConfig`, rather than the verifier guessing).
    ///
    /// These are placeholder digests — a real deployment populates this
    /// table with the actual measured-boot values for its firmware and
    /// bootloader images, the same way `assets/vendor_root.der` is a
    /// placeholder slot for the real vendor root certificate.
    pub static ref BOOT_PROFILES: HashMap<&'static str, BootProfile> = {
        let mut profiles = HashMap::new();
        profiles.insert(
            "simulated-qemu",
            BootProfile {
                name: "simulated-qemu",
                expected_pcrs: HashMap::from([
                    (0, "0000000000000000000000000000000000000000000000000000000000000000"),
                    (1, "0000000000000000000000000000000000000000000000000000000000000000"),
                    (2, "0000000000000000000000000000000000000000000000000000000000000000"),
                    (3, "0000000000000000000000000000000000000000000000000000000000000000"),
                    (4, "0000000000000000000000000000000000000000000000000000000000000000"),
                    (5, "0000000000000000000000000000000000000000000000000000000000000000"),
                ]),
            },
        );
        profiles.insert(
            "production-cloud",
            BootProfile {
                name: "production-cloud",
                expected_pcrs: HashMap::new(),
            },
        );
        profiles
    };
}

/// Look up a boot profile by name.
pub fn lookup(profile_name: &str) -> Option<&'static BootProfile> {
    BOOT_PROFILES.get(profile_name)
}

lazy_static! {
    /// Known container images mapped to the content identifier a verifier
    /// expects their `input_image` event to carry (spec §4.8 step 4, §9:
    /// "a second table maps known container-image names to expected
    /// content identifiers" — catches a build that ran against a
    /// known-bad or unexpectedly-retagged image even though its digest
    /// was faithfully recorded).
    ///
    /// Placeholder digests, same caveat as [`BOOT_PROFILES`]: a real
    /// deployment populates this with the digests it actually trusts.
    pub static ref KNOWN_IMAGES: HashMap<&'static str, &'static str> = {
        let mut images = HashMap::new();
        images.insert(
            "ghcr.io/mithril-security/aicert-fetcher:latest",
            "sha256:0000000000000000000000000000000000000000000000000000000000000000",
        );
        images
    };
}

/// Look up the expected content identifier for a known image name, if any
/// (spec §4.8 step 4: unknown images are not themselves rejected — only a
/// *known* image whose recorded digest doesn't match is).
pub fn lookup_known_image(image_name: &str) -> Option<&'static str> {
    KNOWN_IMAGES.get(image_name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_qemu_profile_covers_the_whole_boot_measurement_range() {
        let profile = lookup("simulated-qemu").expect("profile must exist");
        for pcr in BOOT_MEASUREMENT_PCRS {
            assert!(profile.expected_pcrs.contains_key(&pcr), "missing PCR {pcr}");
        }
    }

    #[test]
    fn unknown_profile_returns_none() {
        assert!(lookup("does-not-exist").is_none());
    }

    #[test]
    fn known_image_lookup_distinguishes_registered_from_unregistered_images() {
        assert!(lookup_known_image("ghcr.io/mithril-security/aicert-fetcher:latest").is_some());
        assert!(lookup_known_image("some/unrelated-image:latest").is_none());
    }
}
