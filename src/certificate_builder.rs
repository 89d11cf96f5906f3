//! Certificate Issuance Module
//!
//! Builds X.509v3 certificates for a subject key, either self-signed or signed by a
//! one-level certificate authority.
//!
//! # Certificate Properties
//! - **Serial**: 128 random bits, non-negative
//! - **Validity**: `[now, now + validity_days)` with second precision
//! - **Basic Constraints**: always present, critical, CA flag from the template
//! - **Key Usage**: digitalSignature, keyEncipherment (+ keyCertSign for CAs)
//! - **Extended Key Usage**: serverAuth, clientAuth
//! - **Subject Alternative Name**: DNS names and email addresses when given
//!
//! # Signature Digest
//!
//! | Signing key | Digest            |
//! |-------------|-------------------|
//! | RSA         | SHA-256           |
//! | ECDSA P-256 | SHA-256           |
//! | ECDSA P-384 | SHA-384           |
//! | ECDSA P-521 | SHA-512           |
//! | ED25519     | none (pure EdDSA) |
//!
//! # Example
//! ```rust,no_run
//! use secret_vault::certificate_builder::{issue, CertificateTemplate, SigningAuthority};
//! use secret_vault::generate_keypair::generate_private_key;
//! use secret_vault::key_material::{parse_certificate_pem, KeyAlgorithm};
//! # fn example() -> secret_vault::error::Result<()> {
//!
//! let ca_key = generate_private_key(KeyAlgorithm::Ecdsa, Some(384))?;
//! let ca = issue(
//!     &CertificateTemplate::new("Example Root CA")
//!         .organization("Example Corp")
//!         .validity_days(3650)
//!         .ca(true),
//!     &ca_key,
//!     None,
//! )?;
//!
//! let authority = SigningAuthority::new(parse_certificate_pem(&ca.pem)?, ca_key);
//! let leaf_key = generate_private_key(KeyAlgorithm::Ed25519, None)?;
//! let leaf = issue(
//!     &CertificateTemplate::new("api.example.com").dns_name("api.example.com"),
//!     &leaf_key,
//!     Some(&authority),
//! )?;
//! assert_eq!(leaf.metadata.issuer, ca.metadata.subject);
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::key_material::{certificate_metadata, CertificateMetadata, PrivateKeyMaterial};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_BITS: i32 = 128;
const SECONDS_PER_DAY: i64 = 86_400;
const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Subject distinguished name fields. Empty fields are left out of the name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectName {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organizational_unit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub province: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub locality: String,
}

impl SubjectName {
    fn to_x509_name(&self) -> std::result::Result<X509Name, ErrorStack> {
        let mut name_builder = X509Name::builder()?;
        // Least specific first, so the rendered DN reads CN,OU,O,L,ST,C
        let entries = [
            (Nid::COUNTRYNAME, &self.country),
            (Nid::STATEORPROVINCENAME, &self.province),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::COMMONNAME, &self.common_name),
        ];
        for (nid, value) in entries {
            if !value.is_empty() {
                name_builder.append_entry_by_nid(nid, value)?;
            }
        }
        Ok(name_builder.build())
    }
}

/// What to put in a new certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTemplate {
    pub subject: SubjectName,
    pub validity_days: u32,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub email_addresses: Vec<String>,
}

impl CertificateTemplate {
    /// Start a template for the given common name with a one year validity.
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            subject: SubjectName {
                common_name: common_name.into(),
                ..SubjectName::default()
            },
            validity_days: DEFAULT_VALIDITY_DAYS,
            is_ca: false,
            dns_names: Vec::new(),
            email_addresses: Vec::new(),
        }
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.subject.organization = organization.into();
        self
    }

    pub fn organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.subject.organizational_unit = unit.into();
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.subject.country = country.into();
        self
    }

    pub fn province(mut self, province: impl Into<String>) -> Self {
        self.subject.province = province.into();
        self
    }

    pub fn locality(mut self, locality: impl Into<String>) -> Self {
        self.subject.locality = locality.into();
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn ca(mut self, is_ca: bool) -> Self {
        self.is_ca = is_ca;
        self
    }

    pub fn dns_name(mut self, name: impl Into<String>) -> Self {
        self.dns_names.push(name.into());
        self
    }

    pub fn email_address(mut self, email: impl Into<String>) -> Self {
        self.email_addresses.push(email.into());
        self
    }
}

/// A CA certificate together with its private key. Holding both in one value makes a
/// half-specified signer unrepresentable.
#[derive(Clone)]
pub struct SigningAuthority {
    pub certificate: X509,
    pub private_key: PrivateKeyMaterial,
}

impl SigningAuthority {
    pub fn new(certificate: X509, private_key: PrivateKeyMaterial) -> Self {
        Self {
            certificate,
            private_key,
        }
    }
}

/// A signed certificate and its metadata summary.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub pem: String,
    pub metadata: CertificateMetadata,
}

fn failed(step: &'static str) -> impl Fn(ErrorStack) -> Error {
    move |e| Error::SigningFailed(format!("failed to {}: {}", step, e))
}

/// Digest used when signing with `key`.
pub fn signature_digest(key: &PrivateKeyMaterial) -> MessageDigest {
    match key {
        PrivateKeyMaterial::Rsa(_) => MessageDigest::sha256(),
        PrivateKeyMaterial::Ecdsa(_) => match key.key_size() {
            384 => MessageDigest::sha384(),
            521 => MessageDigest::sha512(),
            _ => MessageDigest::sha256(),
        },
        PrivateKeyMaterial::Ed25519(_) => MessageDigest::null(),
    }
}

/// Issue a certificate for `subject_key`.
///
/// Without an authority the certificate is self-signed: issuer equals subject and the
/// subject key signs. With an authority the issuer is the authority's subject and the
/// authority key signs. Algorithm families of subject and signer may differ.
///
/// # Arguments
/// * `template` - Subject, validity, CA flag and alternative names
/// * `subject_key` - Key whose public half the certificate binds
/// * `authority` - Optional signing CA
///
/// # Returns
/// * `Result<IssuedCertificate>` - PEM and metadata, or `SigningFailed`
pub fn issue(
    template: &CertificateTemplate,
    subject_key: &PrivateKeyMaterial,
    authority: Option<&SigningAuthority>,
) -> Result<IssuedCertificate> {
    let subject_pkey = subject_key.to_pkey()?;
    let signing_material = authority.map(|a| &a.private_key).unwrap_or(subject_key);
    let signing_pkey = signing_material.to_pkey()?;

    let mut builder = X509::builder().map_err(failed("create X509 builder"))?;
    builder
        .set_version(X509_VERSION_3)
        .map_err(failed("set version"))?;

    // Generate random 128-bit (16-byte) serial number
    let mut serial = BigNum::new().map_err(failed("allocate serial"))?;
    serial
        .rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(failed("generate serial"))?;
    let asn1_serial = serial
        .to_asn1_integer()
        .map_err(failed("encode serial"))?;
    builder
        .set_serial_number(&asn1_serial)
        .map_err(failed("set serial number"))?;

    let subject_name = template
        .subject
        .to_x509_name()
        .map_err(failed("build subject name"))?;
    builder
        .set_subject_name(&subject_name)
        .map_err(failed("set subject name"))?;
    let issuer_name = match authority {
        Some(ca) => ca.certificate.subject_name(),
        None => &*subject_name,
    };
    builder
        .set_issuer_name(issuer_name)
        .map_err(failed("set issuer name"))?;

    let now = Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now).map_err(failed("build notBefore"))?;
    let not_after = Asn1Time::from_unix(now + i64::from(template.validity_days) * SECONDS_PER_DAY)
        .map_err(failed("build notAfter"))?;
    builder
        .set_not_before(&not_before)
        .map_err(failed("set notBefore"))?;
    builder
        .set_not_after(&not_after)
        .map_err(failed("set notAfter"))?;

    builder
        .set_pubkey(&subject_pkey)
        .map_err(failed("set public key"))?;

    let mut basic_constraints = BasicConstraints::new();
    basic_constraints.critical();
    if template.is_ca {
        basic_constraints.ca();
    }
    builder
        .append_extension(
            basic_constraints
                .build()
                .map_err(failed("build basic constraints"))?,
        )
        .map_err(failed("add basic constraints"))?;

    let mut key_usage = KeyUsage::new();
    key_usage.critical().digital_signature().key_encipherment();
    if template.is_ca {
        key_usage.key_cert_sign();
    }
    builder
        .append_extension(key_usage.build().map_err(failed("build key usage"))?)
        .map_err(failed("add key usage"))?;

    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .map_err(failed("build extended key usage"))?,
        )
        .map_err(failed("add extended key usage"))?;

    let issuer_cert = authority.map(|a| &*a.certificate);

    let subject_key_id = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer_cert, None))
        .map_err(failed("build subject key identifier"))?;
    builder
        .append_extension(subject_key_id)
        .map_err(failed("add subject key identifier"))?;

    if let Some(ca) = authority {
        if ca.certificate.subject_key_id().is_some() {
            let authority_key_id = AuthorityKeyIdentifier::new()
                .keyid(false)
                .build(&builder.x509v3_context(issuer_cert, None))
                .map_err(failed("build authority key identifier"))?;
            builder
                .append_extension(authority_key_id)
                .map_err(failed("add authority key identifier"))?;
        }
    }

    if !template.dns_names.is_empty() || !template.email_addresses.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &template.dns_names {
            san.dns(dns);
        }
        for email in &template.email_addresses {
            san.email(email);
        }
        let san = san
            .build(&builder.x509v3_context(issuer_cert, None))
            .map_err(failed("build subject alternative name"))?;
        builder
            .append_extension(san)
            .map_err(failed("add subject alternative name"))?;
    }

    builder
        .sign(&signing_pkey, signature_digest(signing_material))
        .map_err(failed("sign certificate"))?;
    let certificate = builder.build();

    let pem = certificate
        .to_pem()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(failed("encode certificate"))?;
    let metadata = certificate_metadata(&certificate)?;

    debug!(
        subject = %metadata.subject,
        issuer = %metadata.issuer,
        is_ca = template.is_ca,
        "issued certificate"
    );

    Ok(IssuedCertificate { pem, metadata })
}
