//! Verifier (spec §4.8, component C8): offline verification of an
//! [`AttestationBundle`]. Pure and synchronous — no process spawning, no
//! network access — so it can run anywhere, including off the attested
//! host, mirroring the original implementation's standalone
//! `server/server/verify.py` script.
//!
//! Each check short-circuits into its matching [`AttestationError`]
//! variant; later checks are never attempted once one fails (spec §7, §8
//! "Bad chain" scenario).

use std::collections::HashMap;

use openssl::hash::MessageDigest;
use openssl::sign::Verifier as OpensslVerifier;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};
use sha2::{Digest, Sha256};

use crate::canonical::canonical_hash;
use crate::config::BUNDLED_VENDOR_ROOT_DER;
use crate::error::AttestationError;
use crate::event::Event;
use crate::protocol::AttestationBundle;
use crate::registry::{self, BOOT_MEASUREMENT_PCRS};
use crate::tpm::quote;

/// Which binding check step 5 of spec §4.8 performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Replay the event log and require it reproduces the measurement PCR.
    Build,
    /// Require the certificate-binding PCR matches the supplied CA cert.
    Tls { cert_binding_pcr: u8 },
}

/// Everything the caller must supply to run a verification (spec §9 Open
/// Questions: profile name, PCR handles, and vendor root are all
/// deployment-time configuration, never guessed by the verifier).
pub struct VerifyRequest<'a> {
    pub profile: &'a str,
    pub mode: VerifyMode,
    pub measurement_pcr: u8,
    /// Whether this verifier instance accepts `simulation_mode` bundles
    /// (spec §9: "a first-class mode...verifiers must explicitly opt in").
    pub accept_simulation: bool,
    /// DER-encoded vendor root certificate to anchor the chain at.
    /// Defaults to [`BUNDLED_VENDOR_ROOT_DER`] in production; tests supply
    /// a synthetic root instead.
    pub trusted_root_der: &'a [u8],
}

impl<'a> VerifyRequest<'a> {
    /// A build-mode request anchored at the bundled production vendor root.
    pub fn build(profile: &'a str, measurement_pcr: u8) -> Self {
        Self {
            profile,
            mode: VerifyMode::Build,
            measurement_pcr,
            accept_simulation: false,
            trusted_root_der: BUNDLED_VENDOR_ROOT_DER,
        }
    }
}

/// The event log, parsed and ready for the caller, plus whether the
/// bundle it came from was a simulated one (spec §4.8 step 6).
#[derive(Debug, Clone)]
pub struct VerifiedAttestation {
    pub events: Vec<Event>,
    pub simulation_mode: bool,
}

/// Run every check in spec §4.8's order against `bundle`.
pub fn verify(
    bundle: &AttestationBundle,
    request: &VerifyRequest,
) -> Result<VerifiedAttestation, AttestationError> {
    // Step 1: simulation guard.
    if bundle.simulation_mode {
        if !request.accept_simulation {
            return Err(AttestationError::SimulationMismatch);
        }
        return Ok(VerifiedAttestation {
            events: bundle.event_log.clone(),
            simulation_mode: true,
        });
    }

    // Step 2: chain validation.
    let ak_cert = validate_cert_chain(&bundle.ak_cert_chain, request.trusted_root_der)?;

    // Step 3: quote signature check + PCR-dump cross-check.
    let (parsed, pcrs) = verify_quote(
        bundle.quote_message.as_slice(),
        bundle.quote_signature.as_slice(),
        bundle.quote_pcr_dump.as_slice(),
        &ak_cert,
    )?;
    let _ = parsed; // retained for future nonce binding; unused today.

    // Step 4: boot-measurement check, plus a known-image digest check
    // against the Expected-Measurement Registry's second table (spec §9).
    check_boot_measurements(request.profile, &pcrs)?;
    check_known_images(&bundle.event_log)?;

    // Step 5: binding check.
    match request.mode {
        VerifyMode::Build => check_build_binding(request.measurement_pcr, &pcrs, &bundle.event_log)?,
        VerifyMode::Tls { cert_binding_pcr } => {
            check_tls_binding(cert_binding_pcr, &pcrs, bundle.ca_cert.as_ref())?
        }
    }

    // Step 6: parse event log into structured events for the caller.
    Ok(VerifiedAttestation {
        events: bundle.event_log.clone(),
        simulation_mode: false,
    })
}

/// Build a certificate path from `cert_chain[0]` (the AK certificate)
/// using the rest as intermediates, anchored at `trusted_root_der`
/// (spec §4.8 step 2, grounded on the original's `pyOpenSSL`
/// `X509Store`/`X509StoreContext` usage in `verify.py`'s `verify_ak_cert`).
fn validate_cert_chain(
    cert_chain: &[crate::wire::Base64Bytes],
    trusted_root_der: &[u8],
) -> Result<X509, AttestationError> {
    let (ak_der, rest) = cert_chain
        .split_first()
        .ok_or_else(|| AttestationError::MalformedBundle("empty certificate chain".to_string()))?;

    let ak_cert = X509::from_der(ak_der.as_slice())
        .map_err(|e| AttestationError::InvalidCertChain(format!("AK certificate: {e}")))?;

    let root = X509::from_der(trusted_root_der)
        .map_err(|e| AttestationError::InvalidCertChain(format!("vendor root: {e}")))?;
    let mut store_builder = X509StoreBuilder::new()
        .map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    store_builder
        .add_cert(root)
        .map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    let store = store_builder.build();

    let mut intermediates = Stack::new().map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    for cert_der in rest {
        let cert = X509::from_der(cert_der.as_slice())
            .map_err(|e| AttestationError::InvalidCertChain(format!("intermediate certificate: {e}")))?;
        intermediates
            .push(cert)
            .map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    }

    let mut ctx = X509StoreContext::new().map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    let valid = ctx
        .init(&store, &ak_cert, &intermediates, |c| c.verify_cert())
        .map_err(|e| AttestationError::InvalidCertChain(e.to_string()))?;
    if !valid {
        return Err(AttestationError::InvalidCertChain(
            "certificate chain does not validate to the vendor root".to_string(),
        ));
    }

    Ok(ak_cert)
}

/// Verify the quote message's signature against the AK certificate's
/// public key, then cross-check the PCR dump against the digest embedded
/// in the message (spec §4.8 step 3).
fn verify_quote(
    message: &[u8],
    signature: &[u8],
    pcr_dump: &[u8],
    ak_cert: &X509,
) -> Result<(quote::ParsedQuote, HashMap<u8, Vec<u8>>), AttestationError> {
    let parsed = quote::parse(message)?;

    let public_key = ak_cert
        .public_key()
        .map_err(|e| AttestationError::InvalidQuote(format!("reading AK public key: {e}")))?;
    let mut verifier = OpensslVerifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|e| AttestationError::InvalidQuote(e.to_string()))?;
    verifier
        .update(message)
        .map_err(|e| AttestationError::InvalidQuote(e.to_string()))?;
    let signature_valid = verifier
        .verify(signature)
        .map_err(|e| AttestationError::InvalidQuote(format!("signature verification error: {e}")))?;
    if !signature_valid {
        return Err(AttestationError::InvalidQuote(
            "quote signature does not verify against the AK certificate".to_string(),
        ));
    }

    let pcr_values = quote::parse_pcr_dump(pcr_dump)?;
    if pcr_values.len() != parsed.selected_pcrs.len() {
        return Err(AttestationError::InvalidQuote(
            "PCR dump entry count does not match the quote's PCR selection".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    for value in &pcr_values {
        hasher.update(value);
    }
    let recomputed_digest = hasher.finalize();
    if recomputed_digest.as_slice() != parsed.pcr_digest.as_slice() {
        return Err(AttestationError::InvalidQuote(
            "PCR dump does not hash to the quote message's PCR digest".to_string(),
        ));
    }

    let pcrs = parsed
        .selected_pcrs
        .iter()
        .copied()
        .zip(pcr_values.into_iter())
        .collect();
    Ok((parsed, pcrs))
}

/// Compare the configured boot-measurement PCR range against the
/// expected boot profile from the Expected-Measurement Registry (spec
/// §4.8 step 4, component C9).
fn check_boot_measurements(
    profile_name: &str,
    pcrs: &HashMap<u8, Vec<u8>>,
) -> Result<(), AttestationError> {
    let profile = registry::lookup(profile_name).ok_or_else(|| {
        AttestationError::UnexpectedPlatformState {
            pcr: *BOOT_MEASUREMENT_PCRS.start(),
            expected: format!("a registered boot profile named {profile_name:?}"),
            actual: "no such profile".to_string(),
        }
    })?;

    for pcr in BOOT_MEASUREMENT_PCRS {
        let Some(expected_hex) = profile.expected_pcrs.get(&pcr) else {
            continue;
        };
        let actual_hex = pcrs
            .get(&pcr)
            .map(|v| hex::encode(v))
            .unwrap_or_else(|| "<not present in quote>".to_string());
        if !actual_hex.eq_ignore_ascii_case(expected_hex) {
            return Err(AttestationError::UnexpectedPlatformState {
                pcr,
                expected: expected_hex.to_string(),
                actual: actual_hex,
            });
        }
    }
    Ok(())
}

/// Cross-check every `input_image` event against the Expected-Measurement
/// Registry's known-image table (spec §4.8 step 4, §9): a build that ran
/// against a known image name must have resolved it to the digest that
/// name is trusted to mean. Images not listed in the registry are not
/// themselves rejected — only a *known* name with an unexpected digest is.
fn check_known_images(events: &[Event]) -> Result<(), AttestationError> {
    for event in events {
        let Event::InputImage { image } = event else { continue };
        let Some((name, digest)) = image.rsplit_once('@') else { continue };
        let Some(expected) = registry::lookup_known_image(name) else { continue };
        if !expected.eq_ignore_ascii_case(digest) {
            return Err(AttestationError::UnexpectedImageDigest {
                image: name.to_string(),
                expected: expected.to_string(),
                actual: digest.to_string(),
            });
        }
    }
    Ok(())
}

/// Build-mode binding check: replay the event log from the all-zero
/// initial PCR state and require the final value matches the quote's
/// measurement PCR (spec §4.8 step 5, §8 "Tampered event log" scenario).
fn check_build_binding(
    measurement_pcr: u8,
    pcrs: &HashMap<u8, Vec<u8>>,
    events: &[Event],
) -> Result<(), AttestationError> {
    let actual = pcrs
        .get(&measurement_pcr)
        .ok_or_else(|| AttestationError::EventLogMismatch)?;

    let mut pcr = [0u8; 32];
    for event in events {
        let digest_hex = canonical_hash(event)
            .map_err(|e| AttestationError::MalformedBundle(format!("event does not serialize: {e}")))?;
        let digest = hex::decode(&digest_hex)
            .map_err(|e| AttestationError::MalformedBundle(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(pcr);
        hasher.update(&digest);
        pcr = hasher.finalize().into();
    }

    if pcr.as_slice() != actual.as_slice() {
        return Err(AttestationError::EventLogMismatch);
    }
    Ok(())
}

/// TLS-mode binding check: require the certificate-binding PCR equals
/// `SHA256(0x00*32 || SHA256(ca_cert))` (spec §4.8 step 5, §4.7, §9).
fn check_tls_binding(
    cert_binding_pcr: u8,
    pcrs: &HashMap<u8, Vec<u8>>,
    ca_cert: Option<&crate::wire::Base64Bytes>,
) -> Result<(), AttestationError> {
    let ca_cert = ca_cert.ok_or(AttestationError::TlsBindingMismatch)?;
    let actual = pcrs
        .get(&cert_binding_pcr)
        .ok_or(AttestationError::TlsBindingMismatch)?;

    let zero = [0u8; 32];
    let ca_cert_hash = Sha256::digest(ca_cert.as_slice());
    let mut hasher = Sha256::new();
    hasher.update(zero);
    hasher.update(ca_cert_hash);
    let expected: [u8; 32] = hasher.finalize().into();

    if expected.as_slice() != actual.as_slice() {
        return Err(AttestationError::TlsBindingMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OutputFile;
    use crate::wire::Base64Bytes;
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest as OsslDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;
    use openssl::x509::extension::BasicConstraints;
    use openssl::x509::{X509Name, X509NameBuilder};

    /// A minimal self-signed test CA, plus one leaf certificate signed by
    /// it, standing in for the vendor root / AK certificate pair. No
    /// crate in the pack builds synthetic PKI fixtures for tests; this is
    /// a direct transliteration of `openssl`'s own `X509Builder` example
    /// usage into the shape this verifier needs.
    fn build_test_chain() -> (X509, PKey<openssl::pkey::Private>, Vec<u8>) {
        let root_key = Rsa::generate(2048).unwrap();
        let root_pkey = PKey::from_rsa(root_key).unwrap();

        let mut name_builder: X509NameBuilder = X509Name::builder().unwrap();
        name_builder.append_entry_by_text("CN", "Test Vendor Root").unwrap();
        let name = name_builder.build();

        let mut root_builder = X509::builder().unwrap();
        root_builder.set_version(2).unwrap();
        root_builder.set_subject_name(&name).unwrap();
        root_builder.set_issuer_name(&name).unwrap();
        root_builder.set_pubkey(&root_pkey).unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        root_builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
        root_builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        root_builder
            .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
            .unwrap();
        root_builder
            .append_extension(BasicConstraints::new().ca().build().unwrap())
            .unwrap();
        root_builder.sign(&root_pkey, OsslDigest::sha256()).unwrap();
        let root_cert = root_builder.build();

        let ak_key = Rsa::generate(2048).unwrap();
        let ak_pkey = PKey::from_rsa(ak_key).unwrap();
        let mut ak_name_builder = X509Name::builder().unwrap();
        ak_name_builder.append_entry_by_text("CN", "Test AK").unwrap();
        let ak_name = ak_name_builder.build();

        let mut ak_builder = X509::builder().unwrap();
        ak_builder.set_version(2).unwrap();
        ak_builder.set_subject_name(&ak_name).unwrap();
        ak_builder.set_issuer_name(&name).unwrap();
        ak_builder.set_pubkey(&ak_pkey).unwrap();
        let mut ak_serial = BigNum::new().unwrap();
        ak_serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        ak_builder.set_serial_number(&ak_serial.to_asn1_integer().unwrap()).unwrap();
        ak_builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        ak_builder
            .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
            .unwrap();
        ak_builder.sign(&root_pkey, OsslDigest::sha256()).unwrap();
        let ak_cert = ak_builder.build();

        (ak_cert, ak_pkey, root_cert.to_der().unwrap())
    }

    /// Build a well-formed `TPMS_ATTEST` message quoting a single PCR,
    /// a matching `pcr_dump`, and sign the message with `ak_pkey`.
    fn build_quote(
        pcr_index: u8,
        pcr_value: [u8; 32],
        ak_pkey: &PKey<openssl::pkey::Private>,
    ) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let pcr_digest: [u8; 32] = Sha256::digest(pcr_value).into();

        let mut message = Vec::new();
        message.extend_from_slice(&0xff544347u32.to_be_bytes());
        message.extend_from_slice(&0x8018u16.to_be_bytes());
        message.extend_from_slice(&0u16.to_be_bytes()); // qualifiedSigner
        message.extend_from_slice(&0u16.to_be_bytes()); // extraData (empty nonce)
        message.extend_from_slice(&[0u8; 17 + 8]); // clockInfo + firmwareVersion

        message.extend_from_slice(&1u32.to_be_bytes()); // one selection
        message.extend_from_slice(&0x000bu16.to_be_bytes()); // SHA-256 bank
        let byte_index = (pcr_index / 8) as usize;
        let mut bitmap = vec![0u8; byte_index + 1];
        bitmap[byte_index] = 1 << (pcr_index % 8);
        message.push(bitmap.len() as u8);
        message.extend_from_slice(&bitmap);

        message.extend_from_slice(&(pcr_digest.len() as u16).to_be_bytes());
        message.extend_from_slice(&pcr_digest);

        let mut pcr_dump = Vec::new();
        pcr_dump.extend_from_slice(&1u32.to_be_bytes());
        pcr_dump.extend_from_slice(&(pcr_value.len() as u16).to_be_bytes());
        pcr_dump.extend_from_slice(&pcr_value);

        let mut signer = Signer::new(OsslDigest::sha256(), ak_pkey).unwrap();
        signer.update(&message).unwrap();
        let signature = signer.sign_to_vec().unwrap();

        (message, signature, pcr_dump)
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::BuildRequest {
                request: serde_json::json!({"image": "@local/base"}),
            },
            Event::InputImage {
                image: "@local/base@sha256:deadbeef".to_string(),
            },
            Event::Outputs {
                files: vec![OutputFile {
                    path: "out.txt".to_string(),
                    sha256: "abc123".to_string(),
                }],
            },
        ]
    }

    fn measurement_pcr_for(events: &[Event]) -> [u8; 32] {
        let mut pcr = [0u8; 32];
        for event in events {
            let digest_hex = canonical_hash(event).unwrap();
            let digest = hex::decode(digest_hex).unwrap();
            let mut hasher = Sha256::new();
            hasher.update(pcr);
            hasher.update(&digest);
            pcr = hasher.finalize().into();
        }
        pcr
    }

    #[test]
    fn accepts_a_well_formed_bundle() {
        let (ak_cert, ak_pkey, root_der) = build_test_chain();
        let events = sample_events();
        let pcr_value = measurement_pcr_for(&events);
        let (message, signature, pcr_dump) = build_quote(16, pcr_value, &ak_pkey);

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: events,
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![ak_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: None,
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Build,
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        let verified = verify(&bundle, &request).unwrap();
        assert_eq!(verified.events.len(), 3);
        assert!(!verified.simulation_mode);
    }

    #[test]
    fn rejects_tampered_event_log() {
        let (ak_cert, ak_pkey, root_der) = build_test_chain();
        let events = sample_events();
        let pcr_value = measurement_pcr_for(&events);
        let (message, signature, pcr_dump) = build_quote(16, pcr_value, &ak_pkey);

        let mut tampered_events = events;
        tampered_events[1] = Event::InputImage {
            image: "@local/base@sha256:tampered".to_string(),
        };

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: tampered_events,
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![ak_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: None,
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Build,
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        assert_eq!(verify(&bundle, &request), Err(AttestationError::EventLogMismatch));
    }

    #[test]
    fn rejects_a_known_image_with_an_unexpected_digest() {
        let (ak_cert, ak_pkey, root_der) = build_test_chain();
        let mut events = sample_events();
        events.push(Event::InputImage {
            image: "ghcr.io/mithril-security/aicert-fetcher:latest@sha256:not-the-expected-digest"
                .to_string(),
        });
        let pcr_value = measurement_pcr_for(&events);
        let (message, signature, pcr_dump) = build_quote(16, pcr_value, &ak_pkey);

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: events,
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![ak_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: None,
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Build,
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        assert!(matches!(
            verify(&bundle, &request),
            Err(AttestationError::UnexpectedImageDigest { .. })
        ));
    }

    #[test]
    fn rejects_an_unrelated_ak_certificate() {
        let (_, ak_pkey, root_der) = build_test_chain();
        let (unrelated_cert, _, _unrelated_root) = build_test_chain();
        let events = sample_events();
        let pcr_value = measurement_pcr_for(&events);
        let (message, signature, pcr_dump) = build_quote(16, pcr_value, &ak_pkey);

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: events,
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![unrelated_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: None,
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Build,
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        assert!(matches!(
            verify(&bundle, &request),
            Err(AttestationError::InvalidCertChain(_))
        ));
    }

    #[test]
    fn simulated_bundle_rejected_by_a_non_simulation_verifier() {
        let bundle = AttestationBundle {
            simulation_mode: true,
            event_log: sample_events(),
            quote_message: Base64Bytes::default(),
            quote_signature: Base64Bytes::default(),
            quote_pcr_dump: Base64Bytes::default(),
            ak_cert_chain: Vec::new(),
            ca_cert: None,
        };
        let request = VerifyRequest::build("production-cloud", 16);
        assert_eq!(verify(&bundle, &request), Err(AttestationError::SimulationMismatch));
    }

    #[test]
    fn simulated_bundle_accepted_by_a_simulation_verifier() {
        let bundle = AttestationBundle {
            simulation_mode: true,
            event_log: sample_events(),
            quote_message: Base64Bytes::default(),
            quote_signature: Base64Bytes::default(),
            quote_pcr_dump: Base64Bytes::default(),
            ak_cert_chain: Vec::new(),
            ca_cert: None,
        };
        let mut request = VerifyRequest::build("production-cloud", 16);
        request.accept_simulation = true;
        let verified = verify(&bundle, &request).unwrap();
        assert!(verified.simulation_mode);
    }

    #[test]
    fn tls_binding_matches_only_the_bound_ca_cert() {
        let (ak_cert, ak_pkey, root_der) = build_test_chain();
        let ca_cert_der = b"fake-ca-certificate-der".to_vec();
        let ca_hash = Sha256::digest(&ca_cert_der);
        let mut hasher = Sha256::new();
        hasher.update([0u8; 32]);
        hasher.update(ca_hash);
        let cert_binding_pcr_value: [u8; 32] = hasher.finalize().into();

        let (message, signature, pcr_dump) = build_quote(15, cert_binding_pcr_value, &ak_pkey);

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: Vec::new(),
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![ak_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: Some(Base64Bytes(ca_cert_der)),
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Tls { cert_binding_pcr: 15 },
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        assert!(verify(&bundle, &request).is_ok());
    }

    #[test]
    fn tls_binding_rejects_a_mismatched_ca_cert() {
        let (ak_cert, ak_pkey, root_der) = build_test_chain();
        let bound_hash = Sha256::digest(b"the-actual-bound-cert");
        let mut hasher = Sha256::new();
        hasher.update([0u8; 32]);
        hasher.update(bound_hash);
        let cert_binding_pcr_value: [u8; 32] = hasher.finalize().into();

        let (message, signature, pcr_dump) = build_quote(15, cert_binding_pcr_value, &ak_pkey);

        let bundle = AttestationBundle {
            simulation_mode: false,
            event_log: Vec::new(),
            quote_message: message.into(),
            quote_signature: signature.into(),
            quote_pcr_dump: pcr_dump.into(),
            ak_cert_chain: vec![ak_cert.to_der().unwrap().into(), Base64Bytes(root_der.clone())],
            ca_cert: Some(Base64Bytes(b"a-different-cert".to_vec())),
        };

        let request = VerifyRequest {
            profile: "production-cloud",
            mode: VerifyMode::Tls { cert_binding_pcr: 15 },
            measurement_pcr: 16,
            accept_simulation: false,
            trusted_root_der: &root_der,
        };

        assert_eq!(verify(&bundle, &request), Err(AttestationError::TlsBindingMismatch));
    }
}
