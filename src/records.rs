//! Persisted record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key_material::{CertType, CertificateMetadata, KeyAlgorithm};

/// Suffix appended to a key-pair or CA name to locate its private key record.
pub const PRIVATE_KEY_SUFFIX: &str = "-private";
/// Suffix appended to a key-pair name to locate its public key record.
pub const PUBLIC_KEY_SUFFIX: &str = "-public";

/// Name of the private key record that belongs to `name`.
pub fn private_key_name(name: &str) -> String {
    format!("{}{}", name, PRIVATE_KEY_SUFFIX)
}

pub fn public_key_name(name: &str) -> String {
    format!("{}{}", name, PUBLIC_KEY_SUFFIX)
}

/// A stored key or certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: Uuid,
    pub name: String,
    pub cert_type: CertType,
    pub algorithm: KeyAlgorithm,
    pub key_size: Option<u32>,
    pub pem_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CertificateMetadata>,
    pub created_at: DateTime<Utc>,
}

impl CertificateRecord {
    pub fn new(
        name: impl Into<String>,
        cert_type: CertType,
        algorithm: KeyAlgorithm,
        key_size: Option<u32>,
        pem_data: impl Into<String>,
        metadata: Option<CertificateMetadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cert_type,
            algorithm,
            key_size,
            pem_data: pem_data.into(),
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Listing view without PEM contents.
    pub fn summary(&self) -> CertificateSummary {
        CertificateSummary {
            id: self.id,
            name: self.name.clone(),
            cert_type: self.cert_type,
            algorithm: self.algorithm,
            key_size: self.key_size,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub id: Uuid,
    pub name: String,
    pub cert_type: CertType,
    pub algorithm: KeyAlgorithm,
    pub key_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CertificateMetadata>,
    pub created_at: DateTime<Utc>,
}

/// A stored secret. `value` holds the base64 encoding of the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: Uuid,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An API token presented by clients reading secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Grants a token read access to every secret key matching a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub token_id: Uuid,
    pub secret_key_pattern: String,
    pub created_at: DateTime<Utc>,
}

/// An operator who can sign in to the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    /// PBKDF2 hash, see [`crate::credentials`]. Never serialized.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
