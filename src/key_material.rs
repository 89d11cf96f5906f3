//! Key Material Parser
//!
//! Decodes PEM-wrapped keys and certificates into typed material and extracts the
//! algorithm, key size and (for certificates) a metadata summary.
//!
//! Three algorithm families are supported and modelled as explicit tagged unions
//! ([`PrivateKeyMaterial`], [`PublicKeyMaterial`]). Keys of any other family that arrive
//! in a valid wrapper are rejected with [`Error::UnsupportedKeyType`].
//!
//! # PEM tags
//!
//! | Tag                | Contents                    |
//! |--------------------|-----------------------------|
//! | `RSA PRIVATE KEY`  | PKCS#1 RSA private key      |
//! | `EC PRIVATE KEY`   | SEC1 EC private key         |
//! | `PRIVATE KEY`      | PKCS#8 (any family)         |
//! | `PUBLIC KEY`       | SubjectPublicKeyInfo        |
//! | `CERTIFICATE`      | X.509 certificate           |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::ec::EcKey;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::rsa::Rsa;
use openssl::x509::{X509NameRef, X509Ref, X509};
use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;

use crate::error::{Error, Result};

/// Ed25519 keys have a fixed size.
pub const ED25519_KEY_BITS: u32 = 256;

/// Asymmetric algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "ECDSA")]
    Ecdsa,
    #[serde(rename = "ED25519")]
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Ecdsa => "ECDSA",
            KeyAlgorithm::Ed25519 => "ED25519",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RSA" => Ok(KeyAlgorithm::Rsa),
            "ECDSA" => Ok(KeyAlgorithm::Ecdsa),
            "ED25519" => Ok(KeyAlgorithm::Ed25519),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Declared kind of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertType {
    PrivateKey,
    PublicKey,
    Certificate,
    CaCertificate,
}

impl CertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::PrivateKey => "private_key",
            CertType::PublicKey => "public_key",
            CertType::Certificate => "certificate",
            CertType::CaCertificate => "ca_certificate",
        }
    }

    pub fn is_certificate(&self) -> bool {
        matches!(self, CertType::Certificate | CertType::CaCertificate)
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private_key" => Ok(CertType::PrivateKey),
            "public_key" => Ok(CertType::PublicKey),
            "certificate" => Ok(CertType::Certificate),
            "ca_certificate" => Ok(CertType::CaCertificate),
            other => Err(Error::UnsupportedFormat(format!(
                "unknown certificate type '{}'",
                other
            ))),
        }
    }
}

/// A private key of one of the supported families.
#[derive(Clone)]
pub enum PrivateKeyMaterial {
    Rsa(Rsa<Private>),
    Ecdsa(EcKey<Private>),
    Ed25519(PKey<Private>),
}

impl fmt::Debug for PrivateKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKeyMaterial({}, {} bits)", self.algorithm(), self.key_size())
    }
}

impl PrivateKeyMaterial {
    /// Classify a generic OpenSSL key.
    pub fn from_pkey(pkey: PKey<Private>) -> Result<Self> {
        match pkey.id() {
            Id::RSA => pkey
                .rsa()
                .map(PrivateKeyMaterial::Rsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid RSA key: {}", e))),
            Id::EC => pkey
                .ec_key()
                .map(PrivateKeyMaterial::Ecdsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid EC key: {}", e))),
            Id::ED25519 => Ok(PrivateKeyMaterial::Ed25519(pkey)),
            other => Err(Error::UnsupportedKeyType(format!(
                "private key type id {}",
                other.as_raw()
            ))),
        }
    }

    /// Decode a PEM-wrapped private key, dispatching on the PEM tag.
    pub fn from_pem(text: &str) -> Result<Self> {
        let block = decode_pem(text)?;
        Self::from_block(&block)
    }

    fn from_block(block: &pem::Pem) -> Result<Self> {
        let der = block.contents();
        match block.tag() {
            "RSA PRIVATE KEY" => Rsa::private_key_from_der(der)
                .map(PrivateKeyMaterial::Rsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid PKCS#1 key: {}", e))),
            "EC PRIVATE KEY" => EcKey::private_key_from_der(der)
                .map(PrivateKeyMaterial::Ecdsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid SEC1 key: {}", e))),
            "PRIVATE KEY" => {
                let pkey = PKey::private_key_from_pkcs8(der)
                    .map_err(|e| Error::UnsupportedFormat(format!("invalid PKCS#8 key: {}", e)))?;
                Self::from_pkey(pkey)
            }
            tag => Err(Error::UnsupportedFormat(format!(
                "unsupported private key block '{}'",
                tag
            ))),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PrivateKeyMaterial::Rsa(_) => KeyAlgorithm::Rsa,
            PrivateKeyMaterial::Ecdsa(_) => KeyAlgorithm::Ecdsa,
            PrivateKeyMaterial::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    pub fn key_size(&self) -> u32 {
        match self {
            PrivateKeyMaterial::Rsa(rsa) => rsa.n().num_bits() as u32,
            PrivateKeyMaterial::Ecdsa(ec) => ec.group().degree(),
            PrivateKeyMaterial::Ed25519(_) => ED25519_KEY_BITS,
        }
    }

    /// Wrap the key for use with the OpenSSL signing APIs.
    pub fn to_pkey(&self) -> Result<PKey<Private>> {
        let pkey = match self {
            PrivateKeyMaterial::Rsa(rsa) => PKey::from_rsa(rsa.clone()),
            PrivateKeyMaterial::Ecdsa(ec) => PKey::from_ec_key(ec.clone()),
            PrivateKeyMaterial::Ed25519(pkey) => return Ok(pkey.clone()),
        };
        pkey.map_err(|e| Error::SigningFailed(format!("failed to wrap private key: {}", e)))
    }

    /// Private key PEM in the family's native container.
    pub fn private_key_to_pem(&self) -> std::result::Result<String, openssl::error::ErrorStack> {
        let bytes = match self {
            PrivateKeyMaterial::Rsa(rsa) => rsa.private_key_to_pem()?,
            PrivateKeyMaterial::Ecdsa(ec) => ec.private_key_to_pem()?,
            PrivateKeyMaterial::Ed25519(pkey) => pkey.private_key_to_pem_pkcs8()?,
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// SubjectPublicKeyInfo PEM of the matching public key.
    pub fn public_key_to_pem(&self) -> std::result::Result<String, openssl::error::ErrorStack> {
        let bytes = match self {
            PrivateKeyMaterial::Rsa(rsa) => rsa.public_key_to_pem()?,
            PrivateKeyMaterial::Ecdsa(ec) => PKey::from_ec_key(ec.clone())?.public_key_to_pem()?,
            PrivateKeyMaterial::Ed25519(pkey) => pkey.public_key_to_pem()?,
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// A public key of one of the supported families.
#[derive(Clone)]
pub enum PublicKeyMaterial {
    Rsa(Rsa<Public>),
    Ecdsa(EcKey<Public>),
    Ed25519(PKey<Public>),
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyMaterial({}, {} bits)", self.algorithm(), self.key_size())
    }
}

impl PublicKeyMaterial {
    pub fn from_pkey(pkey: PKey<Public>) -> Result<Self> {
        match pkey.id() {
            Id::RSA => pkey
                .rsa()
                .map(PublicKeyMaterial::Rsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid RSA key: {}", e))),
            Id::EC => pkey
                .ec_key()
                .map(PublicKeyMaterial::Ecdsa)
                .map_err(|e| Error::UnsupportedFormat(format!("invalid EC key: {}", e))),
            Id::ED25519 => Ok(PublicKeyMaterial::Ed25519(pkey)),
            other => Err(Error::UnsupportedKeyType(format!(
                "public key type id {}",
                other.as_raw()
            ))),
        }
    }

    /// Decode a `PUBLIC KEY` (SubjectPublicKeyInfo) block.
    pub fn from_pem(text: &str) -> Result<Self> {
        let block = decode_pem(text)?;
        Self::from_block(&block)
    }

    fn from_block(block: &pem::Pem) -> Result<Self> {
        let pkey = PKey::public_key_from_der(block.contents())
            .map_err(|e| Error::UnsupportedFormat(format!("invalid public key: {}", e)))?;
        Self::from_pkey(pkey)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            PublicKeyMaterial::Rsa(_) => KeyAlgorithm::Rsa,
            PublicKeyMaterial::Ecdsa(_) => KeyAlgorithm::Ecdsa,
            PublicKeyMaterial::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    pub fn key_size(&self) -> u32 {
        match self {
            PublicKeyMaterial::Rsa(rsa) => rsa.n().num_bits() as u32,
            PublicKeyMaterial::Ecdsa(ec) => ec.group().degree(),
            PublicKeyMaterial::Ed25519(_) => ED25519_KEY_BITS,
        }
    }
}

/// Summary of a certificate's identity, validity and usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_usage: Vec<String>,
}

/// Result of [`parse_material`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMaterial {
    pub algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub metadata: Option<CertificateMetadata>,
}

/// Decode the outer PEM wrapper.
pub fn decode_pem(text: &str) -> Result<pem::Pem> {
    pem::parse(text).map_err(|e| Error::MalformedEncoding(format!("failed to parse PEM block: {}", e)))
}

/// Parse PEM material according to its declared type.
///
/// # Arguments
/// * `text` - PEM text of a key or certificate
/// * `declared` - The record type the caller claims the material is
///
/// # Returns
/// * `Result<ParsedMaterial>` - Algorithm, key size and, for certificates, metadata
///
/// # Example
/// ```no_run
/// use secret_vault::key_material::{parse_material, CertType};
///
/// let pem = std::fs::read_to_string("server.crt")?;
/// let parsed = parse_material(&pem, CertType::Certificate)?;
/// println!("{} {} bits", parsed.algorithm, parsed.key_size);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn parse_material(text: &str, declared: CertType) -> Result<ParsedMaterial> {
    let block = decode_pem(text)?;

    match declared {
        CertType::Certificate | CertType::CaCertificate => {
            let cert = X509::from_der(block.contents())
                .map_err(|e| Error::UnsupportedFormat(format!("invalid certificate: {}", e)))?;
            let public_key = certificate_public_key(&cert)?;
            Ok(ParsedMaterial {
                algorithm: public_key.algorithm(),
                key_size: public_key.key_size(),
                metadata: Some(certificate_metadata(&cert)?),
            })
        }
        CertType::PrivateKey => {
            let key = PrivateKeyMaterial::from_block(&block)?;
            Ok(ParsedMaterial {
                algorithm: key.algorithm(),
                key_size: key.key_size(),
                metadata: None,
            })
        }
        CertType::PublicKey => {
            let key = PublicKeyMaterial::from_block(&block)?;
            Ok(ParsedMaterial {
                algorithm: key.algorithm(),
                key_size: key.key_size(),
                metadata: None,
            })
        }
    }
}

/// Decode a PEM-wrapped X.509 certificate.
pub fn parse_certificate_pem(text: &str) -> Result<X509> {
    let block = decode_pem(text)?;
    X509::from_der(block.contents())
        .map_err(|e| Error::UnsupportedFormat(format!("invalid certificate: {}", e)))
}

/// Public key embedded in a certificate.
pub fn certificate_public_key(cert: &X509Ref) -> Result<PublicKeyMaterial> {
    let pkey = cert
        .public_key()
        .map_err(|e| Error::UnsupportedFormat(format!("invalid certificate public key: {}", e)))?;
    PublicKeyMaterial::from_pkey(pkey)
}

/// Extract the metadata summary from a certificate.
pub fn certificate_metadata(cert: &X509Ref) -> Result<CertificateMetadata> {
    let serial_number = cert
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_dec_str().map(|s| s.to_string()))
        .map_err(|e| Error::UnsupportedFormat(format!("invalid serial number: {}", e)))?;

    let der = cert
        .to_der()
        .map_err(|e| Error::UnsupportedFormat(format!("failed to encode certificate: {}", e)))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| Error::UnsupportedFormat(format!("invalid certificate: {}", e)))?;

    let is_ca = parsed
        .basic_constraints()
        .ok()
        .flatten()
        .map(|ext| ext.value.ca)
        .unwrap_or(false);

    Ok(CertificateMetadata {
        issuer: format_name(cert.issuer_name()),
        subject: format_name(cert.subject_name()),
        not_before: asn1_to_datetime(cert.not_before())?,
        not_after: asn1_to_datetime(cert.not_after())?,
        serial_number,
        is_ca,
        dns_names: dns_names(cert),
        key_usage: key_usage_names(&parsed),
    })
}

/// DNS subject alternative names.
pub fn dns_names(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn key_usage_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names = Vec::new();

    if let Ok(Some(ext)) = cert.key_usage() {
        let ku = ext.value;
        let flags = [
            (ku.digital_signature(), "digitalSignature"),
            (ku.non_repudiation(), "contentCommitment"),
            (ku.key_encipherment(), "keyEncipherment"),
            (ku.data_encipherment(), "dataEncipherment"),
            (ku.key_agreement(), "keyAgreement"),
            (ku.key_cert_sign(), "keyCertSign"),
            (ku.crl_sign(), "cRLSign"),
            (ku.encipher_only(), "encipherOnly"),
            (ku.decipher_only(), "decipherOnly"),
        ];
        names.extend(flags.iter().filter(|(set, _)| *set).map(|(_, n)| n.to_string()));
    }

    if let Ok(Some(ext)) = cert.extended_key_usage() {
        let eku = ext.value;
        let flags = [
            (eku.any, "any"),
            (eku.server_auth, "serverAuth"),
            (eku.client_auth, "clientAuth"),
            (eku.code_signing, "codeSigning"),
            (eku.email_protection, "emailProtection"),
            (eku.time_stamping, "timeStamping"),
            (eku.ocsp_signing, "OCSPSigning"),
        ];
        names.extend(flags.iter().filter(|(set, _)| *set).map(|(_, n)| n.to_string()));
    }

    names
}

/// Render a distinguished name most-specific first, e.g.
/// `CN=api.example.com,O=Example,C=US`.
///
/// Entries are stored least-specific first (C, ST, L, O, OU, CN), so the string is
/// built in reverse order. Two names compare equal as strings iff their attributes
/// match in order.
pub fn format_name(name: &X509NameRef) -> String {
    let parts: Vec<String> = name
        .entries()
        .map(|entry| {
            let label = match entry.object().nid().short_name() {
                Ok("street") => "STREET".to_string(),
                Ok("postalCode") => "POSTALCODE".to_string(),
                Ok("serialNumber") => "SERIALNUMBER".to_string(),
                Ok(short) => short.to_string(),
                Err(_) => entry.object().to_string(),
            };
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{}={}", label, escape_dn_value(&value))
        })
        .collect();

    parts.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn escape_dn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);

    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == ' ' || c == '#'))
            || (i == last && c == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

/// Convert an ASN.1 time to UTC with second precision.
pub fn asn1_to_datetime(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)
        .map_err(|e| Error::UnsupportedFormat(format!("failed to build epoch: {}", e)))?;
    let diff = epoch
        .diff(time)
        .map_err(|e| Error::UnsupportedFormat(format!("invalid certificate time: {}", e)))?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);

    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::UnsupportedFormat(format!("certificate time out of range: {}", secs)))
}
