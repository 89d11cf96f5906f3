//! Record Storage
//!
//! SQLite record store for keys, certificates, secrets, tokens, permissions, users and
//! login sessions.
//!
//! Connections come from an `r2d2` pool with a single connection, so statements never
//! interleave. Every mutation runs in one immediate transaction and is rolled back
//! whole when any step fails. The calls block; async callers run them on
//! `tokio::task::spawn_blocking`.
//!
//! Schema:
//! - certificates: (id BLOB PRIMARY KEY, name TEXT UNIQUE, cert_type, algorithm, key_size,
//!   pem_data, metadata JSON, created_at)
//! - secrets: (id, key TEXT UNIQUE, value, created_at, updated_at)
//! - tokens: (id, token TEXT UNIQUE, expires_at, created_at)
//! - permissions: (id, token_id -> tokens ON DELETE CASCADE, secret_key_pattern, created_at)
//! - users: (id, username TEXT UNIQUE, password, created_at)
//! - sessions: (token_digest TEXT PRIMARY KEY, user_id -> users ON DELETE CASCADE,
//!   expires_at, created_at)

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, RecordKind, Result};
use crate::records::{private_key_name, CertificateRecord, Permission, Secret, Token, User};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS certificates (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    cert_type TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    key_size INTEGER,
    pem_data TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS secrets (
    id BLOB PRIMARY KEY,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tokens (
    id BLOB PRIMARY KEY,
    token TEXT NOT NULL UNIQUE,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS permissions (
    id BLOB PRIMARY KEY,
    token_id BLOB NOT NULL REFERENCES tokens(id) ON DELETE CASCADE,
    secret_key_pattern TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    id BLOB PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    token_digest TEXT PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const CERTIFICATE_COLUMNS: &str =
    "id, name, cert_type, algorithm, key_size, pem_data, metadata, created_at";
const SECRET_COLUMNS: &str = "id, key, value, created_at, updated_at";
const TOKEN_COLUMNS: &str = "id, token, expires_at, created_at";
const PERMISSION_COLUMNS: &str = "id, token_id, secret_key_pattern, created_at";
const USER_COLUMNS: &str = "id, username, password, created_at";

fn conversion_error(
    index: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
}

fn parse_column<T: FromStr<Err = Error>>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let value: String = row.get(index)?;
    value.parse().map_err(|e| conversion_error(index, e))
}

fn certificate_from_row(row: &Row<'_>) -> rusqlite::Result<CertificateRecord> {
    let metadata: Option<String> = row.get(6)?;
    Ok(CertificateRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        cert_type: parse_column(row, 2)?,
        algorithm: parse_column(row, 3)?,
        key_size: row.get(4)?,
        pem_data: row.get(5)?,
        metadata: metadata
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| conversion_error(6, e))?,
        created_at: row.get(7)?,
    })
}

fn secret_from_row(row: &Row<'_>) -> rusqlite::Result<Secret> {
    Ok(Secret {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<Token> {
    Ok(Token {
        id: row.get(0)?,
        token: row.get(1)?,
        expires_at: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: row.get(0)?,
        token_id: row.get(1)?,
        secret_key_pattern: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn select_all<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let records = stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

// Unique-constraint failures become `AlreadyExists` for the record being written.
fn insert_error(e: rusqlite::Error, kind: RecordKind, name: &str) -> Error {
    if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        Error::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    } else {
        e.into()
    }
}

fn found(changed: usize, kind: RecordKind) -> Result<()> {
    if changed == 0 {
        Err(Error::NotFound(kind))
    } else {
        Ok(())
    }
}

fn insert_certificate_row(conn: &Connection, record: &CertificateRecord) -> Result<()> {
    let metadata = record
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Persistence(format!("failed to encode metadata: {}", e)))?;
    conn.execute(
        &format!(
            "INSERT INTO certificates ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            CERTIFICATE_COLUMNS
        ),
        params![
            record.id,
            record.name,
            record.cert_type.as_str(),
            record.algorithm.as_str(),
            record.key_size,
            record.pem_data,
            metadata,
            record.created_at,
        ],
    )
    .map_err(|e| insert_error(e, RecordKind::Certificate, &record.name))?;
    Ok(())
}

fn certificate_by_name(conn: &Connection, name: &str) -> Result<Option<CertificateRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM certificates WHERE name = ?1", CERTIFICATE_COLUMNS),
            params![name],
            certificate_from_row,
        )
        .optional()?;
    Ok(record)
}

// Created before SQLite opens it, so the database and its journals are owner-only.
fn create_private_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Persistence(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    if path.exists() {
        return Ok(());
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|e| Error::Persistence(format!("failed to create {}: {}", path.display(), e)))?;
    Ok(())
}

/// Shared handle to the record store. Clones share the same pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<SqliteConnectionManager>,
}

impl Storage {
    /// Create an empty in-memory store.
    pub fn new() -> Result<Self> {
        debug!("opening in-memory record store");
        Self::with_manager(SqliteConnectionManager::memory())
    }

    /// Open or create the SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        create_private_file(path)?;
        let storage = Self::with_manager(SqliteConnectionManager::file(path))?;

        let (certificates, secrets, tokens) = storage.transaction(
            TransactionBehavior::Deferred,
            |conn| {
                let count = |table: &str| -> Result<i64> {
                    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?)
                };
                Ok((count("certificates")?, count("secrets")?, count("tokens")?))
            },
        )?;
        info!(
            path = %path.display(),
            certificates,
            secrets,
            tokens,
            "opened record store"
        );
        Ok(storage)
    }

    fn with_manager(manager: SqliteConnectionManager) -> Result<Self> {
        let manager =
            manager.with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
        // One long-lived connection; an in-memory database lives only as long as it does
        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }

    fn transaction<T>(
        &self,
        behavior: TransactionBehavior,
        apply: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(behavior)?;
        // Dropping `tx` without commit rolls back
        let value = apply(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn read<T>(&self, apply: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.get()?;
        apply(&conn)
    }

    fn write<T>(&self, apply: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.transaction(TransactionBehavior::Immediate, apply)
    }

    // ================= Keys and certificates =================

    pub fn insert_certificate(&self, record: CertificateRecord) -> Result<CertificateRecord> {
        self.write(|conn| insert_certificate_row(conn, &record))?;
        Ok(record)
    }

    /// Store both halves of a key pair, or neither.
    pub fn insert_key_pair(
        &self,
        private: CertificateRecord,
        public: CertificateRecord,
    ) -> Result<(CertificateRecord, CertificateRecord)> {
        self.write(|conn| {
            insert_certificate_row(conn, &private)?;
            insert_certificate_row(conn, &public)
        })?;
        Ok((private, public))
    }

    pub fn find_certificate(&self, name: &str) -> Result<Option<CertificateRecord>> {
        self.read(|conn| certificate_by_name(conn, name))
    }

    pub fn get_certificate(&self, name: &str) -> Result<CertificateRecord> {
        self.find_certificate(name)?
            .ok_or(Error::NotFound(RecordKind::Certificate))
    }

    pub fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        self.read(|conn| {
            select_all(
                conn,
                &format!("SELECT {} FROM certificates ORDER BY name", CERTIFICATE_COLUMNS),
                certificate_from_row,
            )
        })
    }

    pub fn delete_certificate(&self, name: &str) -> Result<()> {
        self.write(|conn| {
            let changed = conn.execute("DELETE FROM certificates WHERE name = ?1", params![name])?;
            found(changed, RecordKind::Certificate)
        })
    }

    /// Fetch a CA certificate and its `<name>-private` key in one read transaction.
    ///
    /// # Returns
    /// * `(certificate, private_key)` records, or `NotFound(ca_certificate)` /
    ///   `NotFound(ca_private_key)`
    pub fn signing_material(&self, ca_name: &str) -> Result<(CertificateRecord, CertificateRecord)> {
        self.transaction(TransactionBehavior::Deferred, |conn| {
            let certificate = certificate_by_name(conn, ca_name)?
                .ok_or(Error::NotFound(RecordKind::CaCertificate))?;
            let private_key = certificate_by_name(conn, &private_key_name(ca_name))?
                .ok_or(Error::NotFound(RecordKind::CaPrivateKey))?;
            Ok((certificate, private_key))
        })
    }

    // ================= Secrets =================

    pub fn insert_secret(&self, key: &str, value: String) -> Result<Secret> {
        let now = Utc::now();
        let secret = Secret {
            id: Uuid::new_v4(),
            key: key.to_string(),
            value,
            created_at: now,
            updated_at: now,
        };
        self.write(|conn| {
            conn.execute(
                &format!("INSERT INTO secrets ({}) VALUES (?1, ?2, ?3, ?4, ?5)", SECRET_COLUMNS),
                params![
                    secret.id,
                    secret.key,
                    secret.value,
                    secret.created_at,
                    secret.updated_at
                ],
            )
            .map_err(|e| insert_error(e, RecordKind::Secret, key))
        })?;
        Ok(secret)
    }

    pub fn get_secret(&self, key: &str) -> Result<Secret> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM secrets WHERE key = ?1", SECRET_COLUMNS),
                params![key],
                secret_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound(RecordKind::Secret))
        })
    }

    pub fn list_secrets(&self) -> Result<Vec<Secret>> {
        self.read(|conn| {
            select_all(
                conn,
                &format!("SELECT {} FROM secrets ORDER BY key", SECRET_COLUMNS),
                secret_from_row,
            )
        })
    }

    pub fn update_secret(&self, key: &str, value: String) -> Result<Secret> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE secrets SET value = ?1, updated_at = ?2 WHERE key = ?3",
                params![value, Utc::now(), key],
            )?;
            found(changed, RecordKind::Secret)?;
            Ok(conn.query_row(
                &format!("SELECT {} FROM secrets WHERE key = ?1", SECRET_COLUMNS),
                params![key],
                secret_from_row,
            )?)
        })
    }

    pub fn delete_secret(&self, key: &str) -> Result<()> {
        self.write(|conn| {
            let changed = conn.execute("DELETE FROM secrets WHERE key = ?1", params![key])?;
            found(changed, RecordKind::Secret)
        })
    }

    // ================= Tokens =================

    pub fn insert_token(&self, value: &str, expires_at: Option<DateTime<Utc>>) -> Result<Token> {
        let token = Token {
            id: Uuid::new_v4(),
            token: value.to_string(),
            expires_at,
            created_at: Utc::now(),
        };
        self.write(|conn| {
            conn.execute(
                &format!("INSERT INTO tokens ({}) VALUES (?1, ?2, ?3, ?4)", TOKEN_COLUMNS),
                params![token.id, token.token, token.expires_at, token.created_at],
            )
            .map_err(|e| insert_error(e, RecordKind::Token, "token value"))
        })?;
        Ok(token)
    }

    pub fn list_tokens(&self) -> Result<Vec<Token>> {
        self.read(|conn| {
            select_all(
                conn,
                &format!("SELECT {} FROM tokens ORDER BY created_at", TOKEN_COLUMNS),
                token_from_row,
            )
        })
    }

    pub fn update_token_expiry(
        &self,
        id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Token> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE tokens SET expires_at = ?1 WHERE id = ?2",
                params![expires_at, id],
            )?;
            found(changed, RecordKind::Token)?;
            Ok(conn.query_row(
                &format!("SELECT {} FROM tokens WHERE id = ?1", TOKEN_COLUMNS),
                params![id],
                token_from_row,
            )?)
        })
    }

    /// Delete a token together with its permissions.
    pub fn delete_token(&self, id: Uuid) -> Result<()> {
        self.write(|conn| {
            let removed_permissions =
                conn.execute("DELETE FROM permissions WHERE token_id = ?1", params![id])?;
            let changed = conn.execute("DELETE FROM tokens WHERE id = ?1", params![id])?;
            found(changed, RecordKind::Token)?;
            debug!(token_id = %id, removed_permissions, "deleted token");
            Ok(())
        })
    }

    /// Look up a token by its bearer value along with its permissions.
    pub fn token_with_permissions(&self, value: &str) -> Result<Option<(Token, Vec<Permission>)>> {
        self.transaction(TransactionBehavior::Deferred, |conn| {
            let Some(token) = conn
                .query_row(
                    &format!("SELECT {} FROM tokens WHERE token = ?1", TOKEN_COLUMNS),
                    params![value],
                    token_from_row,
                )
                .optional()?
            else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM permissions WHERE token_id = ?1 ORDER BY created_at",
                PERMISSION_COLUMNS
            ))?;
            let permissions = stmt
                .query_map(params![token.id], permission_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some((token, permissions)))
        })
    }

    // ================= Permissions =================

    pub fn insert_permission(&self, token_id: Uuid, pattern: &str) -> Result<Permission> {
        let permission = Permission {
            id: Uuid::new_v4(),
            token_id,
            secret_key_pattern: pattern.to_string(),
            created_at: Utc::now(),
        };
        self.write(|conn| {
            let token_exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tokens WHERE id = ?1)",
                params![token_id],
                |row| row.get(0),
            )?;
            if !token_exists {
                return Err(Error::NotFound(RecordKind::Token));
            }
            conn.execute(
                &format!("INSERT INTO permissions ({}) VALUES (?1, ?2, ?3, ?4)", PERMISSION_COLUMNS),
                params![
                    permission.id,
                    permission.token_id,
                    permission.secret_key_pattern,
                    permission.created_at
                ],
            )?;
            Ok(())
        })?;
        Ok(permission)
    }

    pub fn list_permissions(&self) -> Result<Vec<Permission>> {
        self.read(|conn| {
            select_all(
                conn,
                &format!("SELECT {} FROM permissions ORDER BY created_at", PERMISSION_COLUMNS),
                permission_from_row,
            )
        })
    }

    pub fn update_permission(&self, id: Uuid, pattern: &str) -> Result<Permission> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE permissions SET secret_key_pattern = ?1 WHERE id = ?2",
                params![pattern, id],
            )?;
            found(changed, RecordKind::Permission)?;
            Ok(conn.query_row(
                &format!("SELECT {} FROM permissions WHERE id = ?1", PERMISSION_COLUMNS),
                params![id],
                permission_from_row,
            )?)
        })
    }

    pub fn delete_permission(&self, id: Uuid) -> Result<()> {
        self.write(|conn| {
            let changed = conn.execute("DELETE FROM permissions WHERE id = ?1", params![id])?;
            found(changed, RecordKind::Permission)
        })
    }

    // ================= Users and sessions =================

    pub fn insert_user(&self, username: &str, password_hash: String) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash,
            created_at: Utc::now(),
        };
        self.write(|conn| {
            conn.execute(
                &format!("INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4)", USER_COLUMNS),
                params![user.id, user.username, user.password_hash, user.created_at],
            )
            .map_err(|e| insert_error(e, RecordKind::User, username))
        })?;
        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                    params![username],
                    user_from_row,
                )
                .optional()?)
        })
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.read(|conn| {
            select_all(
                conn,
                &format!("SELECT {} FROM users ORDER BY created_at", USER_COLUMNS),
                user_from_row,
            )
        })
    }

    /// Replace a user's password hash and end all of their sessions.
    pub fn update_user_password(&self, id: Uuid, password_hash: String) -> Result<User> {
        self.write(|conn| {
            let changed = conn.execute(
                "UPDATE users SET password = ?1 WHERE id = ?2",
                params![password_hash, id],
            )?;
            found(changed, RecordKind::User)?;
            conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![id])?;
            Ok(conn.query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )?)
        })
    }

    /// Delete a user; their sessions go with them.
    pub fn delete_user(&self, id: Uuid) -> Result<()> {
        self.write(|conn| {
            let changed = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
            found(changed, RecordKind::User)
        })
    }

    pub fn insert_session(
        &self,
        token_digest: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT INTO sessions (token_digest, user_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![token_digest, user_id, expires_at, Utc::now()],
            )
            .map_err(|e| insert_error(e, RecordKind::User, "session"))?;
            Ok(())
        })
    }

    /// Resolve a session digest to its user. Sessions expired at `now` are removed.
    pub fn session_user(&self, token_digest: &str, now: DateTime<Utc>) -> Result<Option<User>> {
        self.write(|conn| {
            let session = conn
                .query_row(
                    "SELECT s.expires_at, u.id, u.username, u.password, u.created_at
                     FROM sessions s JOIN users u ON u.id = s.user_id
                     WHERE s.token_digest = ?1",
                    params![token_digest],
                    |row| {
                        let expires_at: DateTime<Utc> = row.get(0)?;
                        let user = User {
                            id: row.get(1)?,
                            username: row.get(2)?,
                            password_hash: row.get(3)?,
                            created_at: row.get(4)?,
                        };
                        Ok((expires_at, user))
                    },
                )
                .optional()?;

            match session {
                Some((expires_at, user)) if now < expires_at => Ok(Some(user)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM sessions WHERE token_digest = ?1",
                        params![token_digest],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }
}
