//! Secret Vault server
//!
//! Loads configuration (`config.toml` or the path given as the first argument),
//! opens the record store and serves the HTTP API until interrupted.

use anyhow::{Context, Result};
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use secret_vault::configs::AppConfig;
use secret_vault::credentials::random_token;
use secret_vault::storage::Storage;
use secret_vault::vault::Vault;
use secret_vault::webserver::start_webserver;

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::from_file(&path)?,
        None => AppConfig::load()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage = match &config.storage.data_path {
        Some(path) => {
            info!(path = %path.display(), "opening record store");
            Storage::open(path).context("Failed to open record store")?
        }
        None => {
            warn!("no storage.data_path configured, records are kept in memory only");
            Storage::new().context("Failed to create in-memory record store")?
        }
    };

    let vault = Vault::new(storage)
        .with_session_ttl(Duration::minutes(config.auth.session_ttl_minutes));
    bootstrap_user(&config, &vault)?;

    let admin_token = match config.auth.admin_token.clone() {
        Some(token) => token,
        None => {
            let token = random_token().context("Failed to generate admin token")?;
            warn!(
                "no auth.admin_token configured; generated one for this run: {}",
                token
            );
            SecretString::new(token)
        }
    };

    start_webserver(config, vault, admin_token)
}

fn bootstrap_user(config: &AppConfig, vault: &Vault) -> Result<()> {
    let (password, generated) = match &config.auth.bootstrap_password {
        Some(password) => (password.expose_secret().clone(), false),
        None => (
            random_token().context("Failed to generate bootstrap password")?,
            true,
        ),
    };

    if let Some(user) = vault
        .ensure_bootstrap_user(&password)
        .context("Failed to create bootstrap user")?
    {
        if generated {
            warn!(
                username = %user.username,
                "no auth.bootstrap_password configured; generated password: {}",
                password
            );
        } else {
            info!(username = %user.username, "created bootstrap user");
        }
    }
    Ok(())
}
