//! Error types shared by the trust engine, the record store and the service layer.
//!
//! Every failure carries a human-readable cause. The HTTP layer maps each variant to a
//! status code in [`crate::webserver`].

use std::fmt;

use crate::key_material::KeyAlgorithm;

/// Kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    PrivateKey,
    CaCertificate,
    CaPrivateKey,
    Certificate,
    Permission,
    Token,
    User,
    Secret,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::PrivateKey => "private_key",
            RecordKind::CaCertificate => "ca_certificate",
            RecordKind::CaPrivateKey => "ca_private_key",
            RecordKind::Certificate => "certificate",
            RecordKind::Permission => "permission",
            RecordKind::Token => "token",
            RecordKind::User => "user",
            RecordKind::Secret => "secret",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported key size {size} for {algorithm}")]
    UnsupportedKeySize { algorithm: KeyAlgorithm, size: u32 },

    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("{0} not found")]
    NotFound(RecordKind),

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: RecordKind, name: String },

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Persistence(format!("connection pool: {}", e))
    }
}

impl Error {
    /// Short machine-readable name, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Error::UnsupportedKeySize { .. } => "unsupported_key_size",
            Error::MalformedEncoding(_) => "malformed_encoding",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::UnsupportedKeyType(_) => "unsupported_key_type",
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::SigningFailed(_) => "signing_failed",
            Error::GenerationFailed(_) => "generation_failed",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidInput(_) => "invalid_input",
            Error::Persistence(_) => "persistence",
            Error::Internal(_) => "internal",
        }
    }
}
