//! Secret Vault - Secret Store with a Certificate Trust Engine
//!
//! A small secret server that keeps application secrets behind pattern-scoped API
//! tokens and manages X.509 material (key pairs, imported certificates, issued
//! certificates) in the same record store.
//!
//! # Overview
//!
//! ```text
//! Client ── Authorization: Api <token> ──> pattern check ──> secret
//! Admin  ── Authorization: Bearer <admin|session> ──> secrets / tokens / permissions
//!                                          └─> key pairs ──> certificates ──> verify
//! ```
//!
//! # Features
//!
//! - **Access patterns**: `*` wildcards matched in order against secret keys
//! - **Key generation**: RSA (default 2048), ECDSA (P-256/P-384/P-521), Ed25519
//! - **Certificate issuance**: self-signed or CA-signed, with SAN and CA extensions
//! - **Verification**: signature, validity window and CA checks in one report
//! - **Audit trail**: every mutation and secret read on the `audit` tracing target
//!
//! # Quick Start
//!
//! ```bash
//! # Optional: config.toml in the working directory, or pass a path
//! cargo build --release
//! RUST_LOG=info,audit=info ./target/release/secret-vault config.toml
//! ```
//!
//! # Module Overview
//!
//! ## [`pattern_matcher`]
//!
//! ```
//! use secret_vault::pattern_matcher::matches;
//!
//! assert!(matches("prod/db/password", "prod/*"));
//! assert!(!matches("dev/db/password", "prod/*"));
//! ```
//!
//! ## [`generate_keypair`] and [`certificate_builder`]
//!
//! ```no_run
//! use secret_vault::certificate_builder::{issue, CertificateTemplate};
//! use secret_vault::generate_keypair::generate_private_key;
//! use secret_vault::key_material::KeyAlgorithm;
//!
//! let key = generate_private_key(KeyAlgorithm::Ecdsa, None)?;
//! let template = CertificateTemplate::new("api.internal")
//!     .organization("ACME Corp")
//!     .dns_name("api.internal")
//!     .validity_days(90);
//! let issued = issue(&template, &key, None)?;
//! println!("{}", issued.pem);
//! # Ok::<(), secret_vault::error::Error>(())
//! ```
//!
//! ## [`verification`]
//!
//! ```no_run
//! use secret_vault::verification::verify_pem;
//! # let cert_pem = String::new();
//!
//! let report = verify_pem(&cert_pem, None)?;
//! if !report.valid {
//!     eprintln!("{:?}", report.errors);
//! }
//! # Ok::<(), secret_vault::error::Error>(())
//! ```
//!
//! ## [`vault`] and [`storage`]
//!
//! [`vault::Vault`] wraps [`storage::Storage`] with validation and audit logging.
//! Records live in SQLite, either an in-memory database or a file opened with
//! owner-only permissions. User passwords and session tokens are handled in
//! [`credentials`].
//!
//! ## [`webserver`]
//!
//! axum router for the HTTP API; see the module docs for the route table.
//!
//! # Error Handling
//!
//! Library operations return [`error::Result`], whose [`error::Error`] variants map
//! onto HTTP status codes in the web layer. Startup and configuration code uses
//! `anyhow::Result`.

pub mod audit;
pub mod certificate_builder;
pub mod configs;
pub mod credentials;
pub mod error;
pub mod generate_keypair;
pub mod key_material;
pub mod pattern_matcher;
pub mod protocol;
pub mod records;
pub mod storage;
pub mod vault;
pub mod verification;
pub mod webserver;
