//! Audit trail events.
//!
//! Every state change and every secret read is reported as a `tracing` event on the
//! `audit` target, so operators can route the trail with an `EnvFilter` directive such
//! as `audit=info`.

use std::fmt;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Error,
    Unauthorized,
    Ingest,
    Delete,
    GetSecret,
    GetFullEnv,
    UpdateSecret,
    UpdateToken,
    UpdatePermission,
    GetSecrets,
    GetTokens,
    GetPermissions,
    GetUsers,
    GetCertificates,
    LoginSuccess,
    LoginFailed,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Error => "error",
            AuditEvent::Unauthorized => "unauthorized",
            AuditEvent::Ingest => "ingest",
            AuditEvent::Delete => "delete",
            AuditEvent::GetSecret => "get-secret",
            AuditEvent::GetFullEnv => "get-full-env",
            AuditEvent::UpdateSecret => "update-secret",
            AuditEvent::UpdateToken => "update-token",
            AuditEvent::UpdatePermission => "update-permission",
            AuditEvent::GetSecrets => "get-secrets",
            AuditEvent::GetTokens => "get-tokens",
            AuditEvent::GetPermissions => "get-permissions",
            AuditEvent::GetUsers => "get-users",
            AuditEvent::GetCertificates => "get-certificates",
            AuditEvent::LoginSuccess => "login-success",
            AuditEvent::LoginFailed => "login-failed",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emit one audit record. Failures and rejections are logged at `warn`.
pub fn record(event: AuditEvent, actor: &str, message: &str) {
    match event {
        AuditEvent::Error | AuditEvent::Unauthorized | AuditEvent::LoginFailed => {
            warn!(target: "audit", event = %event, actor, "{}", message)
        }
        _ => info!(target: "audit", event = %event, actor, "{}", message),
    }
}
