//! Protocol Module
//!
//! Request and response bodies of the HTTP API. Every response is wrapped in the
//! envelope `{"success": bool, "data": ...}`; failures carry `"error"` instead of
//! `"data"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certificate_builder::{CertificateTemplate, SubjectName};
use crate::records::CertificateRecord;

/// Successful response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Failure response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

// ================= Certificates =================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateKeyPairRequest {
    pub name: String,
    pub algorithm: String,
    #[serde(default)]
    pub key_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImportCertificateRequest {
    pub name: String,
    pub cert_type: String,
    pub pem_data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateCertificateRequest {
    pub name: String,
    pub private_key_name: String,
    pub subject: SubjectName,
    pub validity_days: u32,
    #[serde(default)]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_addresses: Vec<String>,
    /// CA certificate to sign with; its key must be stored as `<name>-private`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_cert_name: Option<String>,
}

impl GenerateCertificateRequest {
    pub fn template(&self) -> CertificateTemplate {
        CertificateTemplate {
            subject: self.subject.clone(),
            validity_days: self.validity_days,
            is_ca: self.is_ca,
            dns_names: self.dns_names.clone(),
            email_addresses: self.email_addresses.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyCertificateRequest {
    pub certificate_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairRecords {
    pub private_key: CertificateRecord,
    pub public_key: CertificateRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedCertificate {
    pub name: String,
    pub pem_data: String,
}

// ================= Secrets, tokens, permissions, users =================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateSecretRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateSecretRequest {
    pub value: String,
}

/// `?key=` query parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretKeyQuery {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateTokenRequest {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateTokenRequest {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreatePermissionRequest {
    pub secret_key_pattern: String,
    pub token_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdatePermissionRequest {
    pub secret_key_pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateUserRequest {
    pub password: String,
}

// ================= Login =================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Session bearer token for the management API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
