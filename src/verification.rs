//! Certificate Verification Module
//!
//! Checks a certificate's validity window, self-signature and, optionally, its
//! signature against a CA certificate. Every problem found is collected in the
//! report's `errors` list; verification never short-circuits on the first failure.
//!
//! A certificate that verifies against the supplied CA is reported `valid` even when it
//! is expired or not yet valid. Callers that need a strict answer should also check
//! `expired` and `not_yet_valid`.

use chrono::{DateTime, Utc};
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use x509_parser::x509::X509Version;

use crate::error::Result;
use crate::key_material::{certificate_metadata, parse_certificate_pem};

/// Outcome of verifying one certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub expired: bool,
    pub not_yet_valid: bool,
    pub self_signed: bool,
    pub errors: Vec<String>,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
}

/// Verify `cert` at the current time.
pub fn verify(cert: &X509Ref, ca: Option<&X509Ref>) -> Result<VerificationReport> {
    verify_at(cert, ca, Utc::now())
}

/// Verify PEM-encoded certificates at the current time.
pub fn verify_pem(cert_pem: &str, ca_pem: Option<&str>) -> Result<VerificationReport> {
    let cert = parse_certificate_pem(cert_pem)?;
    let ca = ca_pem.map(parse_certificate_pem).transpose()?;
    verify(&cert, ca.as_deref())
}

/// Verify `cert` as of `now`.
///
/// # Arguments
/// * `cert` - Certificate under test
/// * `ca` - Optional CA certificate that should have signed `cert`
/// * `now` - Reference time for the validity window
///
/// # Returns
/// * `Result<VerificationReport>` - Fails only when the certificate's own fields
///   cannot be read; verification failures are reported in the report
pub fn verify_at(
    cert: &X509Ref,
    ca: Option<&X509Ref>,
    now: DateTime<Utc>,
) -> Result<VerificationReport> {
    let metadata = certificate_metadata(cert)?;
    let mut errors = Vec::new();

    let not_yet_valid = now < metadata.not_before;
    if not_yet_valid {
        errors.push("certificate is not yet valid".to_string());
    }
    let expired = now >= metadata.not_after;
    if expired {
        errors.push("certificate has expired".to_string());
    }

    let self_signed = metadata.issuer == metadata.subject;
    if self_signed {
        if let Err(reason) = check_signature(cert, cert) {
            errors.push(format!("invalid self-signature: {}", reason));
        }
    }

    let valid = match ca {
        Some(ca) => match check_signer(ca).and_then(|_| check_signature(cert, ca)) {
            Ok(()) => true,
            Err(reason) => {
                errors.push(format!("signature verification failed: {}", reason));
                false
            }
        },
        None => self_signed && errors.is_empty(),
    };

    Ok(VerificationReport {
        valid,
        expired,
        not_yet_valid,
        self_signed,
        errors,
        subject: metadata.subject,
        issuer: metadata.issuer,
        not_before: metadata.not_before,
        not_after: metadata.not_after,
        serial_number: metadata.serial_number,
        is_ca: metadata.is_ca,
        dns_names: metadata.dns_names,
    })
}

fn check_signature(cert: &X509Ref, signer: &X509Ref) -> std::result::Result<(), String> {
    let key = signer
        .public_key()
        .map_err(|e| format!("unreadable signer public key: {}", e))?;
    match cert.verify(&key) {
        Ok(true) => Ok(()),
        Ok(false) => Err("signature does not match signer public key".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

// A v3 signer must assert CA in basic constraints and, when key usage is present,
// allow certificate signing.
fn check_signer(ca: &X509Ref) -> std::result::Result<(), String> {
    const NOT_A_SIGNER: &str = "parent certificate cannot sign this kind of certificate";

    let der = ca
        .to_der()
        .map_err(|e| format!("unreadable CA certificate: {}", e))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| format!("unreadable CA certificate: {}", e))?;

    if parsed.version() == X509Version::V3 {
        let is_ca = matches!(parsed.basic_constraints(), Ok(Some(ext)) if ext.value.ca);
        if !is_ca {
            return Err(NOT_A_SIGNER.to_string());
        }
    }
    if let Ok(Some(ext)) = parsed.key_usage() {
        if !ext.value.key_cert_sign() {
            return Err(NOT_A_SIGNER.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_builder::{issue, CertificateTemplate, SigningAuthority};
    use crate::generate_keypair::generate_private_key;
    use crate::key_material::{KeyAlgorithm, PrivateKeyMaterial};
    use chrono::Duration;
    use openssl::x509::X509;

    fn self_signed(
        algorithm: KeyAlgorithm,
        template: CertificateTemplate,
    ) -> (X509, PrivateKeyMaterial) {
        let key = generate_private_key(algorithm, None).unwrap();
        let issued = issue(&template, &key, None).unwrap();
        (parse_certificate_pem(&issued.pem).unwrap(), key)
    }

    fn signed_by(
        authority: &SigningAuthority,
        template: CertificateTemplate,
    ) -> X509 {
        let key = generate_private_key(KeyAlgorithm::Ecdsa, None).unwrap();
        let issued = issue(&template, &key, Some(authority)).unwrap();
        parse_certificate_pem(&issued.pem).unwrap()
    }

    #[test]
    fn test_self_signed_certificate_is_valid() {
        for algorithm in [KeyAlgorithm::Rsa, KeyAlgorithm::Ecdsa, KeyAlgorithm::Ed25519] {
            let (cert, _) = self_signed(algorithm, CertificateTemplate::new("self"));
            let report = verify(&cert, None).unwrap();

            assert!(report.valid, "{} errors: {:?}", algorithm, report.errors);
            assert!(report.self_signed);
            assert!(!report.expired);
            assert!(!report.not_yet_valid);
            assert!(report.errors.is_empty());
            assert_eq!(report.subject, "CN=self");
        }
    }

    #[test]
    fn test_ca_signed_certificate_is_valid() {
        let (ca_cert, ca_key) = self_signed(
            KeyAlgorithm::Rsa,
            CertificateTemplate::new("Root CA").ca(true),
        );
        let authority = SigningAuthority::new(ca_cert.clone(), ca_key);
        let leaf = signed_by(
            &authority,
            CertificateTemplate::new("leaf").dns_name("leaf.internal"),
        );

        let report = verify(&leaf, Some(&ca_cert)).unwrap();
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(!report.self_signed);
        assert_eq!(report.issuer, "CN=Root CA");
        assert_eq!(report.dns_names, vec!["leaf.internal".to_string()]);
    }

    #[test]
    fn test_ca_signed_without_ca_is_not_valid() {
        let (ca_cert, ca_key) = self_signed(
            KeyAlgorithm::Ed25519,
            CertificateTemplate::new("Root CA").ca(true),
        );
        let authority = SigningAuthority::new(ca_cert, ca_key);
        let leaf = signed_by(&authority, CertificateTemplate::new("leaf"));

        let report = verify(&leaf, None).unwrap();
        assert!(!report.valid);
        assert!(!report.self_signed);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_zero_day_certificate_is_expired_a_second_later() {
        let (cert, _) = self_signed(
            KeyAlgorithm::Ecdsa,
            CertificateTemplate::new("short").validity_days(0),
        );
        let report = verify_at(&cert, None, Utc::now() + Duration::seconds(1)).unwrap();

        assert!(report.expired);
        assert!(!report.valid);
        assert!(report
            .errors
            .contains(&"certificate has expired".to_string()));
    }

    #[test]
    fn test_not_yet_valid() {
        let (cert, _) = self_signed(KeyAlgorithm::Ed25519, CertificateTemplate::new("future"));
        let report = verify_at(&cert, None, Utc::now() - Duration::days(1)).unwrap();

        assert!(report.not_yet_valid);
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["certificate is not yet valid".to_string()]);
    }

    #[test]
    fn test_wrong_ca_fails_signature() {
        let (ca_cert, ca_key) = self_signed(
            KeyAlgorithm::Ecdsa,
            CertificateTemplate::new("Real CA").ca(true),
        );
        let (other_ca, _) = self_signed(
            KeyAlgorithm::Ecdsa,
            CertificateTemplate::new("Other CA").ca(true),
        );
        let leaf = signed_by(
            &SigningAuthority::new(ca_cert, ca_key),
            CertificateTemplate::new("leaf"),
        );

        let report = verify(&leaf, Some(&other_ca)).unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("signature verification failed: "));
    }

    #[test]
    fn test_non_ca_signer_is_rejected() {
        let (fake_ca, fake_key) = self_signed(KeyAlgorithm::Rsa, CertificateTemplate::new("leafy"));
        let leaf = signed_by(
            &SigningAuthority::new(fake_ca.clone(), fake_key),
            CertificateTemplate::new("child"),
        );

        let report = verify(&leaf, Some(&fake_ca)).unwrap();
        assert!(!report.valid);
        assert!(report.errors[0].contains("cannot sign"));
    }

    #[test]
    fn test_expired_but_ca_verified_is_still_valid() {
        let (ca_cert, ca_key) = self_signed(
            KeyAlgorithm::Ed25519,
            CertificateTemplate::new("Root CA").ca(true).validity_days(3650),
        );
        let leaf = signed_by(
            &SigningAuthority::new(ca_cert.clone(), ca_key),
            CertificateTemplate::new("leaf").validity_days(1),
        );

        let report = verify_at(&leaf, Some(&ca_cert), Utc::now() + Duration::days(2)).unwrap();
        assert!(report.expired);
        assert!(report.valid);
    }

    #[test]
    fn test_report_json_keys() {
        let (cert, _) = self_signed(KeyAlgorithm::Ed25519, CertificateTemplate::new("keys"));
        let report = verify(&cert, None).unwrap();
        let value = serde_json::to_value(&report).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "valid",
            "expired",
            "not_yet_valid",
            "self_signed",
            "errors",
            "subject",
            "issuer",
            "not_before",
            "not_after",
            "serial_number",
            "is_ca",
            "dns_names",
        ] {
            assert!(object.contains_key(key), "missing {}", key);
        }
        assert_eq!(object.len(), 12);
    }
}
