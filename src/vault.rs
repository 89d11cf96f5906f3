//! Vault service
//!
//! Orchestrates the record store and the trust engine. Each operation resolves named
//! records, hands PEM material to the key generator, parser, issuance or verification
//! modules, persists the outcome and writes an audit record.
//!
//! Management operations take an `actor` naming who performed them (for the audit
//! trail): either the admin token holder or the id of a user signed in through
//! [`Vault::login`]. Secret reads authenticate with an API token instead, see
//! [`Vault::read_secret`].
//!
//! Every call blocks on the record store.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::certificate_builder::{issue, SigningAuthority};
use crate::credentials::{hash_password, random_token, token_digest, verify_password};
use crate::error::{Error, RecordKind, Result};
use crate::generate_keypair::generate_keypair;
use crate::key_material::{parse_certificate_pem, parse_material, CertType, PrivateKeyMaterial};
use crate::pattern_matcher::authorizes;
use crate::protocol::{
    CreatePermissionRequest, CreateSecretRequest, CreateTokenRequest, CreateUserRequest,
    ExportedCertificate, GenerateCertificateRequest, GenerateKeyPairRequest,
    ImportCertificateRequest, KeyPairRecords, LoginRequest, LoginResponse,
    UpdatePermissionRequest, UpdateSecretRequest, UpdateTokenRequest, UpdateUserRequest,
    VerifyCertificateRequest,
};
use crate::records::{
    private_key_name, public_key_name, CertificateRecord, CertificateSummary, Permission, Secret,
    Token, User,
};
use crate::storage::Storage;
use crate::verification::{verify, VerificationReport};

/// Authorization scheme accepted on the secret read path.
pub const API_TOKEN_SCHEME: &str = "Api";

/// Username created on first start when no users exist.
pub const BOOTSTRAP_USERNAME: &str = "admin";

const DEFAULT_SESSION_TTL_MINUTES: i64 = 720;

// Write an audit record for the outcome and pass it through.
fn audited<T>(
    actor: &str,
    event: AuditEvent,
    action: impl FnOnce() -> String,
    result: Result<T>,
) -> Result<T> {
    match &result {
        Ok(_) => audit::record(event, actor, &action()),
        Err(e @ Error::Unauthorized(_)) => {
            audit::record(AuditEvent::Unauthorized, actor, &format!("{}: {}", action(), e))
        }
        Err(e) => audit::record(AuditEvent::Error, actor, &format!("{}: {}", action(), e)),
    }
    result
}

#[derive(Clone)]
pub struct Vault {
    storage: Storage,
    session_ttl: Duration,
}

impl Vault {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            session_ttl: Duration::minutes(DEFAULT_SESSION_TTL_MINUTES),
        }
    }

    /// Lifetime of session tokens issued by [`Vault::login`].
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Create user `admin` with `password` when the store has no users.
    pub fn ensure_bootstrap_user(&self, password: &str) -> Result<Option<User>> {
        if !self.storage.list_users()?.is_empty() {
            return Ok(None);
        }
        let user = self
            .storage
            .insert_user(BOOTSTRAP_USERNAME, hash_password(password)?)?;
        audit::record(AuditEvent::Ingest, "system", "created bootstrap user");
        Ok(Some(user))
    }

    fn ensure_certificate_name_free(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidInput("name must not be empty".to_string()));
        }
        if self.storage.find_certificate(name)?.is_some() {
            return Err(Error::AlreadyExists {
                kind: RecordKind::Certificate,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ================= Keys and certificates =================

    pub fn list_certificates(&self, actor: &str) -> Result<Vec<CertificateSummary>> {
        let result = self
            .storage
            .list_certificates()
            .map(|records| records.iter().map(CertificateRecord::summary).collect());
        audited(
            actor,
            AuditEvent::GetCertificates,
            || "list certificates".to_string(),
            result,
        )
    }

    pub fn get_certificate(&self, actor: &str, name: &str) -> Result<CertificateRecord> {
        audited(
            actor,
            AuditEvent::GetCertificates,
            || format!("get certificate {}", name),
            self.storage.get_certificate(name),
        )
    }

    pub fn export_certificate(&self, actor: &str, name: &str) -> Result<ExportedCertificate> {
        let result = self
            .storage
            .get_certificate(name)
            .map(|record| ExportedCertificate {
                name: record.name,
                pem_data: record.pem_data,
            });
        audited(
            actor,
            AuditEvent::GetCertificates,
            || format!("export certificate {}", name),
            result,
        )
    }

    /// Generate a key pair and store it as `<name>-private` and `<name>-public`.
    pub fn generate_keypair(
        &self,
        actor: &str,
        request: &GenerateKeyPairRequest,
    ) -> Result<KeyPairRecords> {
        let result = (|| -> Result<KeyPairRecords> {
            let private_name = private_key_name(&request.name);
            let public_name = public_key_name(&request.name);
            self.ensure_certificate_name_free(&private_name)?;
            self.ensure_certificate_name_free(&public_name)?;

            let pair = generate_keypair(&request.algorithm, request.key_size)?;
            let private_key = CertificateRecord::new(
                private_name,
                CertType::PrivateKey,
                pair.algorithm,
                Some(pair.key_size),
                pair.private_pem,
                None,
            );
            let public_key = CertificateRecord::new(
                public_name,
                CertType::PublicKey,
                pair.algorithm,
                Some(pair.key_size),
                pair.public_pem,
                None,
            );
            let (private_key, public_key) = self.storage.insert_key_pair(private_key, public_key)?;
            Ok(KeyPairRecords {
                private_key,
                public_key,
            })
        })();

        audited(
            actor,
            AuditEvent::Ingest,
            || format!("generate key pair {}", request.name),
            result,
        )
    }

    /// Validate and store externally produced PEM material.
    pub fn import_certificate(
        &self,
        actor: &str,
        request: &ImportCertificateRequest,
    ) -> Result<CertificateRecord> {
        let result = (|| -> Result<CertificateRecord> {
            self.ensure_certificate_name_free(&request.name)?;
            let cert_type: CertType = request.cert_type.parse()?;
            let parsed = parse_material(&request.pem_data, cert_type)?;
            let record = CertificateRecord::new(
                request.name.clone(),
                cert_type,
                parsed.algorithm,
                Some(parsed.key_size),
                request.pem_data.clone(),
                parsed.metadata,
            );
            self.storage.insert_certificate(record)
        })();

        audited(
            actor,
            AuditEvent::Ingest,
            || format!("import certificate {}", request.name),
            result,
        )
    }

    /// Issue a certificate for a stored private key, self-signed or signed by a stored CA.
    ///
    /// The stored record takes its algorithm and key size from the subject's private key
    /// record and is typed `ca_certificate` when the request asks for a CA.
    pub fn generate_certificate(
        &self,
        actor: &str,
        request: &GenerateCertificateRequest,
    ) -> Result<CertificateRecord> {
        let result = (|| -> Result<CertificateRecord> {
            self.ensure_certificate_name_free(&request.name)?;

            let key_record = self
                .storage
                .find_certificate(&request.private_key_name)?
                .ok_or(Error::NotFound(RecordKind::PrivateKey))?;
            let subject_key = PrivateKeyMaterial::from_pem(&key_record.pem_data)?;

            let authority = match &request.signing_cert_name {
                Some(ca_name) => {
                    let (ca_record, ca_key_record) = self.storage.signing_material(ca_name)?;
                    Some(SigningAuthority::new(
                        parse_certificate_pem(&ca_record.pem_data)?,
                        PrivateKeyMaterial::from_pem(&ca_key_record.pem_data)?,
                    ))
                }
                None => None,
            };

            let issued = issue(&request.template(), &subject_key, authority.as_ref())?;
            let cert_type = if request.is_ca {
                CertType::CaCertificate
            } else {
                CertType::Certificate
            };
            let record = CertificateRecord::new(
                request.name.clone(),
                cert_type,
                key_record.algorithm,
                key_record.key_size,
                issued.pem,
                Some(issued.metadata),
            );
            self.storage.insert_certificate(record)
        })();

        audited(
            actor,
            AuditEvent::Ingest,
            || format!("generate certificate {}", request.name),
            result,
        )
    }

    pub fn verify_certificate(
        &self,
        actor: &str,
        request: &VerifyCertificateRequest,
    ) -> Result<VerificationReport> {
        let result = (|| -> Result<VerificationReport> {
            let record = self.storage.get_certificate(&request.certificate_name)?;
            if !record.cert_type.is_certificate() {
                return Err(Error::InvalidInput(format!(
                    "{} is a {}, not a certificate",
                    record.name, record.cert_type
                )));
            }
            let cert = parse_certificate_pem(&record.pem_data)?;
            let ca = match &request.ca_cert_name {
                Some(ca_name) => {
                    let ca_record = self
                        .storage
                        .find_certificate(ca_name)?
                        .filter(|ca| ca.cert_type.is_certificate())
                        .ok_or(Error::NotFound(RecordKind::CaCertificate))?;
                    Some(parse_certificate_pem(&ca_record.pem_data)?)
                }
                None => None,
            };
            verify(&cert, ca.as_deref())
        })();

        audited(
            actor,
            AuditEvent::GetCertificates,
            || format!("verify certificate {}", request.certificate_name),
            result,
        )
    }

    pub fn delete_certificate(&self, actor: &str, name: &str) -> Result<()> {
        audited(
            actor,
            AuditEvent::Delete,
            || format!("delete certificate {}", name),
            self.storage.delete_certificate(name),
        )
    }

    // ================= Secrets =================

    pub fn list_secrets(&self, actor: &str) -> Result<Vec<Secret>> {
        audited(
            actor,
            AuditEvent::GetSecrets,
            || "list secrets".to_string(),
            self.storage.list_secrets(),
        )
    }

    pub fn create_secret(&self, actor: &str, request: &CreateSecretRequest) -> Result<Secret> {
        let result = if request.key.is_empty() {
            Err(Error::InvalidInput("secret key must not be empty".to_string()))
        } else {
            self.storage
                .insert_secret(&request.key, BASE64.encode(&request.value))
        };
        audited(
            actor,
            AuditEvent::Ingest,
            || format!("create secret {}", request.key),
            result,
        )
    }

    pub fn update_secret(
        &self,
        actor: &str,
        key: &str,
        request: &UpdateSecretRequest,
    ) -> Result<Secret> {
        audited(
            actor,
            AuditEvent::UpdateSecret,
            || format!("update secret {}", key),
            self.storage.update_secret(key, BASE64.encode(&request.value)),
        )
    }

    pub fn delete_secret(&self, actor: &str, key: &str) -> Result<()> {
        audited(
            actor,
            AuditEvent::Delete,
            || format!("delete secret {}", key),
            self.storage.delete_secret(key),
        )
    }

    fn authenticate_token(&self, authorization: Option<&str>) -> Result<(Token, Vec<Permission>)> {
        let header = authorization.unwrap_or_default().trim();
        let value = header
            .strip_prefix(API_TOKEN_SCHEME)
            .and_then(|rest| rest.strip_prefix(' '))
            .ok_or_else(|| {
                Error::Unauthorized(format!(
                    "unsupported token type, supported token types: {}",
                    API_TOKEN_SCHEME
                ))
            })?;

        let (token, permissions) = self
            .storage
            .token_with_permissions(value)?
            .ok_or_else(|| Error::Unauthorized("invalid token".to_string()))?;
        if token.is_expired_at(Utc::now()) {
            return Err(Error::Unauthorized(format!("token {} has expired", token.id)));
        }
        Ok((token, permissions))
    }

    /// Read one secret with an `Api <token>` authorization value.
    ///
    /// The token must exist, must not be expired and at least one of its permission
    /// patterns must cover `key`. Coverage is checked before the lookup, so a token
    /// cannot discover keys outside its scope.
    pub fn read_secret(&self, authorization: Option<&str>, key: &str) -> Result<Secret> {
        let (token, permissions) = match self.authenticate_token(authorization) {
            Ok(found) => found,
            Err(e) => {
                let action = || format!("get secret {}", key);
                return audited("anonymous", AuditEvent::GetSecret, action, Err(e));
            }
        };
        let actor = token.id.to_string();

        let patterns = permissions.iter().map(|p| p.secret_key_pattern.as_str());
        let result = if authorizes(key, patterns) {
            self.storage.get_secret(key)
        } else {
            Err(Error::Unauthorized(format!(
                "token {} can't access {}",
                token.id, key
            )))
        };

        audited(&actor, AuditEvent::GetSecret, || format!("get secret {}", key), result)
    }

    /// Every secret the presenting token may read.
    pub fn list_readable_secrets(&self, authorization: Option<&str>) -> Result<Vec<Secret>> {
        let (token, permissions) = match self.authenticate_token(authorization) {
            Ok(found) => found,
            Err(e) => {
                let action = || "list secrets".to_string();
                return audited("anonymous", AuditEvent::GetFullEnv, action, Err(e));
            }
        };

        let readable = self.storage.list_secrets().map(|secrets| {
            secrets
                .into_iter()
                .filter(|secret| {
                    authorizes(
                        &secret.key,
                        permissions.iter().map(|p| p.secret_key_pattern.as_str()),
                    )
                })
                .collect()
        });

        audited(
            &token.id.to_string(),
            AuditEvent::GetFullEnv,
            || "list secrets".to_string(),
            readable,
        )
    }

    // ================= Tokens =================

    pub fn list_tokens(&self, actor: &str) -> Result<Vec<Token>> {
        audited(
            actor,
            AuditEvent::GetTokens,
            || "list tokens".to_string(),
            self.storage.list_tokens(),
        )
    }

    pub fn create_token(&self, actor: &str, request: &CreateTokenRequest) -> Result<Token> {
        let result = if request.token.trim().is_empty() {
            Err(Error::InvalidInput("token must not be empty".to_string()))
        } else {
            self.storage.insert_token(&request.token, request.expires_at)
        };
        audited(actor, AuditEvent::Ingest, || "create token".to_string(), result)
    }

    pub fn update_token(
        &self,
        actor: &str,
        id: Uuid,
        request: &UpdateTokenRequest,
    ) -> Result<Token> {
        audited(
            actor,
            AuditEvent::UpdateToken,
            || format!("update token {}", id),
            self.storage.update_token_expiry(id, request.expires_at),
        )
    }

    pub fn delete_token(&self, actor: &str, id: Uuid) -> Result<()> {
        audited(
            actor,
            AuditEvent::Delete,
            || format!("delete token {}", id),
            self.storage.delete_token(id),
        )
    }

    // ================= Permissions =================

    pub fn list_permissions(&self, actor: &str) -> Result<Vec<Permission>> {
        audited(
            actor,
            AuditEvent::GetPermissions,
            || "list permissions".to_string(),
            self.storage.list_permissions(),
        )
    }

    pub fn create_permission(
        &self,
        actor: &str,
        request: &CreatePermissionRequest,
    ) -> Result<Permission> {
        audited(
            actor,
            AuditEvent::Ingest,
            || {
                format!(
                    "create permission '{}' for token {}",
                    request.secret_key_pattern, request.token_id
                )
            },
            self.storage
                .insert_permission(request.token_id, &request.secret_key_pattern),
        )
    }

    pub fn update_permission(
        &self,
        actor: &str,
        id: Uuid,
        request: &UpdatePermissionRequest,
    ) -> Result<Permission> {
        audited(
            actor,
            AuditEvent::UpdatePermission,
            || format!("update permission {}", id),
            self.storage
                .update_permission(id, &request.secret_key_pattern),
        )
    }

    pub fn delete_permission(&self, actor: &str, id: Uuid) -> Result<()> {
        audited(
            actor,
            AuditEvent::Delete,
            || format!("delete permission {}", id),
            self.storage.delete_permission(id),
        )
    }

    // ================= Users and login =================

    pub fn list_users(&self, actor: &str) -> Result<Vec<User>> {
        audited(
            actor,
            AuditEvent::GetUsers,
            || "list users".to_string(),
            self.storage.list_users(),
        )
    }

    pub fn create_user(&self, actor: &str, request: &CreateUserRequest) -> Result<User> {
        let result = if request.username.trim().is_empty() {
            Err(Error::InvalidInput("username must not be empty".to_string()))
        } else {
            hash_password(&request.password)
                .and_then(|hash| self.storage.insert_user(&request.username, hash))
        };
        audited(
            actor,
            AuditEvent::Ingest,
            || format!("create user {}", request.username),
            result,
        )
    }

    /// Set a new password. The user's open sessions end.
    pub fn update_user(&self, actor: &str, id: Uuid, request: &UpdateUserRequest) -> Result<User> {
        let result = hash_password(&request.password)
            .and_then(|hash| self.storage.update_user_password(id, hash));
        audited(actor, AuditEvent::Ingest, || format!("update user {}", id), result)
    }

    pub fn delete_user(&self, actor: &str, id: Uuid) -> Result<()> {
        audited(
            actor,
            AuditEvent::Delete,
            || format!("delete user {}", id),
            self.storage.delete_user(id),
        )
    }

    /// Check a username and password and open a session.
    ///
    /// Only the SHA-256 digest of the returned token is stored. Unknown users and wrong
    /// passwords fail the same way.
    pub fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let user = self
            .storage
            .find_user_by_username(&request.username)?
            .filter(|user| verify_password(&request.password, &user.password_hash));
        let Some(user) = user else {
            audit::record(
                AuditEvent::LoginFailed,
                &request.username,
                "invalid username or password",
            );
            return Err(Error::Unauthorized("invalid username or password".to_string()));
        };

        let token = random_token()?;
        let expires_at = Utc::now() + self.session_ttl;
        self.storage
            .insert_session(&token_digest(&token), user.id, expires_at)?;
        audit::record(
            AuditEvent::LoginSuccess,
            &user.id.to_string(),
            &format!("{} logged in", user.username),
        );
        Ok(LoginResponse { token, expires_at })
    }

    /// Resolve a session token from [`Vault::login`] to its user.
    pub fn authenticate_session(&self, token: &str) -> Result<User> {
        self.storage
            .session_user(&token_digest(token), Utc::now())?
            .ok_or_else(|| Error::Unauthorized("invalid or expired session".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_builder::SubjectName;
    use crate::key_material::KeyAlgorithm;

    const ACTOR: &str = "tester";

    fn vault() -> Vault {
        Vault::new(Storage::new().unwrap())
    }

    fn keypair(vault: &Vault, name: &str, algorithm: &str) -> KeyPairRecords {
        vault
            .generate_keypair(
                ACTOR,
                &GenerateKeyPairRequest {
                    name: name.to_string(),
                    algorithm: algorithm.to_string(),
                    key_size: None,
                },
            )
            .unwrap()
    }

    fn certificate_request(name: &str, key: &str, is_ca: bool) -> GenerateCertificateRequest {
        GenerateCertificateRequest {
            name: name.to_string(),
            private_key_name: key.to_string(),
            subject: SubjectName {
                common_name: name.to_string(),
                organization: "Example".to_string(),
                ..SubjectName::default()
            },
            validity_days: 30,
            is_ca,
            dns_names: vec![format!("{}.internal", name)],
            email_addresses: Vec::new(),
            signing_cert_name: None,
        }
    }

    #[test]
    fn test_generate_keypair_stores_both_halves() {
        let vault = vault();
        let pair = keypair(&vault, "svc", "ECDSA");

        assert_eq!(pair.private_key.name, "svc-private");
        assert_eq!(pair.public_key.name, "svc-public");
        assert_eq!(pair.private_key.algorithm, pair.public_key.algorithm);
        assert_eq!(pair.private_key.key_size, Some(256));
        assert_eq!(pair.public_key.cert_type, CertType::PublicKey);

        let again = vault.generate_keypair(
            ACTOR,
            &GenerateKeyPairRequest {
                name: "svc".to_string(),
                algorithm: "RSA".to_string(),
                key_size: None,
            },
        );
        assert!(matches!(again, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn test_generate_keypair_unknown_algorithm() {
        let result = vault().generate_keypair(
            ACTOR,
            &GenerateKeyPairRequest {
                name: "x".to_string(),
                algorithm: "DSA".to_string(),
                key_size: None,
            },
        );
        assert!(matches!(result, Err(Error::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_ca_chain_through_named_records() {
        let vault = vault();
        keypair(&vault, "root", "RSA");
        let ca = vault
            .generate_certificate(ACTOR, &certificate_request("root", "root-private", true))
            .unwrap();
        assert_eq!(ca.cert_type, CertType::CaCertificate);
        assert_eq!(ca.algorithm, KeyAlgorithm::Rsa);

        keypair(&vault, "web", "ED25519");
        let mut request = certificate_request("web", "web-private", false);
        request.signing_cert_name = Some("root".to_string());
        let leaf = vault.generate_certificate(ACTOR, &request).unwrap();
        assert_eq!(leaf.cert_type, CertType::Certificate);
        assert_eq!(leaf.algorithm, KeyAlgorithm::Ed25519);
        assert_eq!(leaf.key_size, Some(256));

        let report = vault
            .verify_certificate(
                ACTOR,
                &VerifyCertificateRequest {
                    certificate_name: "web".to_string(),
                    ca_cert_name: Some("root".to_string()),
                },
            )
            .unwrap();
        assert!(report.valid, "errors: {:?}", report.errors);
        assert_eq!(report.issuer, "CN=root,O=Example");
    }

    #[test]
    fn test_missing_private_key_and_ca_key() {
        let vault = vault();
        let result = vault.generate_certificate(ACTOR, &certificate_request("c", "nope", false));
        assert!(matches!(result, Err(Error::NotFound(RecordKind::PrivateKey))));

        // A CA certificate imported without its "-private" companion cannot sign
        keypair(&vault, "ca", "ECDSA");
        let ca = vault
            .generate_certificate(ACTOR, &certificate_request("imported-ca", "ca-private", true))
            .unwrap();
        vault
            .import_certificate(
                ACTOR,
                &ImportCertificateRequest {
                    name: "lonely-ca".to_string(),
                    cert_type: "ca_certificate".to_string(),
                    pem_data: ca.pem_data,
                },
            )
            .unwrap();

        let mut request = certificate_request("leaf", "ca-private", false);
        request.signing_cert_name = Some("lonely-ca".to_string());
        let result = vault.generate_certificate(ACTOR, &request);
        assert!(matches!(result, Err(Error::NotFound(RecordKind::CaPrivateKey))));

        request.signing_cert_name = Some("missing".to_string());
        let result = vault.generate_certificate(ACTOR, &request);
        assert!(matches!(result, Err(Error::NotFound(RecordKind::CaCertificate))));
    }

    #[test]
    fn test_import_extracts_metadata() {
        let vault = vault();
        keypair(&vault, "k", "ED25519");
        let cert = vault
            .generate_certificate(ACTOR, &certificate_request("self", "k-private", false))
            .unwrap();

        let imported = vault
            .import_certificate(
                ACTOR,
                &ImportCertificateRequest {
                    name: "copy".to_string(),
                    cert_type: "certificate".to_string(),
                    pem_data: cert.pem_data.clone(),
                },
            )
            .unwrap();
        let metadata = imported.metadata.unwrap();
        assert_eq!(metadata.subject, "CN=self,O=Example");
        assert_eq!(metadata.dns_names, vec!["self.internal".to_string()]);

        let bad = vault.import_certificate(
            ACTOR,
            &ImportCertificateRequest {
                name: "bad".to_string(),
                cert_type: "certificate".to_string(),
                pem_data: "not pem".to_string(),
            },
        );
        assert!(matches!(bad, Err(Error::MalformedEncoding(_))));
    }

    #[test]
    fn test_export_returns_pem() {
        let vault = vault();
        keypair(&vault, "k", "RSA");
        let exported = vault.export_certificate(ACTOR, "k-public").unwrap();
        assert!(exported.pem_data.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(matches!(
            vault.export_certificate(ACTOR, "nope"),
            Err(Error::NotFound(RecordKind::Certificate))
        ));
    }

    fn secret_fixture(vault: &Vault, token: &str, patterns: &[&str]) -> Token {
        for key in ["prod/db/password", "prod/api/key", "staging/db/password"] {
            vault
                .create_secret(
                    ACTOR,
                    &CreateSecretRequest {
                        key: key.to_string(),
                        value: format!("value of {}", key),
                    },
                )
                .unwrap();
        }
        let token = vault
            .create_token(
                ACTOR,
                &CreateTokenRequest {
                    token: token.to_string(),
                    expires_at: None,
                },
            )
            .unwrap();
        for pattern in patterns {
            vault
                .create_permission(
                    ACTOR,
                    &CreatePermissionRequest {
                        secret_key_pattern: pattern.to_string(),
                        token_id: token.id,
                    },
                )
                .unwrap();
        }
        token
    }

    #[test]
    fn test_read_secret_with_matching_permission() {
        let vault = vault();
        secret_fixture(&vault, "reader", &["prod/db/*"]);

        let secret = vault
            .read_secret(Some("Api reader"), "prod/db/password")
            .unwrap();
        assert_eq!(secret.value, BASE64.encode("value of prod/db/password"));

        let denied = vault.read_secret(Some("Api reader"), "prod/api/key");
        assert!(matches!(denied, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_read_secret_rejects_bad_credentials() {
        let vault = vault();
        secret_fixture(&vault, "reader", &["*"]);

        for header in [None, Some("Bearer reader"), Some("Api"), Some("Api wrong")] {
            let result = vault.read_secret(header, "prod/db/password");
            assert!(matches!(result, Err(Error::Unauthorized(_))), "{:?}", header);
        }
    }

    #[test]
    fn test_unauthorized_key_does_not_reveal_existence() {
        let vault = vault();
        secret_fixture(&vault, "reader", &["prod/*"]);

        let missing_in_scope = vault.read_secret(Some("Api reader"), "prod/none");
        assert!(matches!(missing_in_scope, Err(Error::NotFound(RecordKind::Secret))));

        let missing_out_of_scope = vault.read_secret(Some("Api reader"), "dev/none");
        assert!(matches!(missing_out_of_scope, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let vault = vault();
        let token = secret_fixture(&vault, "old", &["*"]);
        vault
            .update_token(
                ACTOR,
                token.id,
                &UpdateTokenRequest {
                    expires_at: Some(Utc::now() - Duration::minutes(1)),
                },
            )
            .unwrap();

        let result = vault.read_secret(Some("Api old"), "prod/db/password");
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_list_readable_secrets_filters_by_pattern() {
        let vault = vault();
        secret_fixture(&vault, "reader", &["*/db/*"]);

        let readable = vault.list_readable_secrets(Some("Api reader")).unwrap();
        let keys: Vec<_> = readable.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["prod/db/password", "staging/db/password"]);
    }

    #[test]
    fn test_update_secret_encodes_value() {
        let vault = vault();
        vault
            .create_secret(
                ACTOR,
                &CreateSecretRequest {
                    key: "k".to_string(),
                    value: "one".to_string(),
                },
            )
            .unwrap();
        let updated = vault
            .update_secret(
                ACTOR,
                "k",
                &UpdateSecretRequest {
                    value: "two".to_string(),
                },
            )
            .unwrap();
        assert_eq!(updated.value, BASE64.encode("two"));
    }

    #[test]
    fn test_verify_rejects_key_records() {
        let vault = vault();
        keypair(&vault, "k", "ED25519");
        let result = vault.verify_certificate(
            ACTOR,
            &VerifyCertificateRequest {
                certificate_name: "k-public".to_string(),
                ca_cert_name: None,
            },
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        vault
            .generate_certificate(ACTOR, &certificate_request("leaf", "k-private", false))
            .unwrap();
        let result = vault.verify_certificate(
            ACTOR,
            &VerifyCertificateRequest {
                certificate_name: "leaf".to_string(),
                ca_cert_name: Some("k-private".to_string()),
            },
        );
        assert!(matches!(result, Err(Error::NotFound(RecordKind::CaCertificate))));
    }

    #[test]
    fn test_bootstrap_user_created_once() {
        let vault = vault();
        assert!(vault.ensure_bootstrap_user("first").unwrap().is_some());
        assert!(vault.ensure_bootstrap_user("second").unwrap().is_none());
        assert_eq!(vault.list_users(ACTOR).unwrap().len(), 1);

        let login = |password: &str| {
            vault.login(&LoginRequest {
                username: BOOTSTRAP_USERNAME.to_string(),
                password: password.to_string(),
            })
        };
        assert!(login("first").is_ok());
        assert!(matches!(login("second"), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_login_issues_session_for_user() {
        let vault = vault();
        let user = vault
            .create_user(
                ACTOR,
                &CreateUserRequest {
                    username: "ops".to_string(),
                    password: "pa55word".to_string(),
                },
            )
            .unwrap();
        assert_ne!(user.password_hash, "pa55word");

        let session = vault
            .login(&LoginRequest {
                username: "ops".to_string(),
                password: "pa55word".to_string(),
            })
            .unwrap();
        assert!(session.expires_at > Utc::now());
        assert_eq!(vault.authenticate_session(&session.token).unwrap().id, user.id);

        for (username, password) in [("ops", "wrong"), ("nobody", "pa55word")] {
            let result = vault.login(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            });
            assert!(matches!(result, Err(Error::Unauthorized(_))), "{}", username);
        }
        assert!(matches!(
            vault.authenticate_session("forged"),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_password_change_ends_sessions() {
        let vault = vault();
        let user = vault
            .create_user(
                ACTOR,
                &CreateUserRequest {
                    username: "ops".to_string(),
                    password: "old".to_string(),
                },
            )
            .unwrap();
        let session = vault
            .login(&LoginRequest {
                username: "ops".to_string(),
                password: "old".to_string(),
            })
            .unwrap();

        vault
            .update_user(
                ACTOR,
                user.id,
                &UpdateUserRequest {
                    password: "new".to_string(),
                },
            )
            .unwrap();
        assert!(vault.authenticate_session(&session.token).is_err());
        assert!(vault
            .login(&LoginRequest {
                username: "ops".to_string(),
                password: "new".to_string(),
            })
            .is_ok());
    }

    #[test]
    fn test_expired_session_is_rejected() {
        let vault = vault().with_session_ttl(Duration::seconds(-1));
        vault
            .create_user(
                ACTOR,
                &CreateUserRequest {
                    username: "ops".to_string(),
                    password: "pw".to_string(),
                },
            )
            .unwrap();
        let session = vault
            .login(&LoginRequest {
                username: "ops".to_string(),
                password: "pw".to_string(),
            })
            .unwrap();
        assert!(matches!(
            vault.authenticate_session(&session.token),
            Err(Error::Unauthorized(_))
        ));
    }
}
