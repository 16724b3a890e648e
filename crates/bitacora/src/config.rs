//! Runtime configuration shared by every subcommand

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::warn;

use crate::auth::SessionKey;

/// Which backend holds audit records
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `audits.json` next to `users.json`
    Json,
    /// `bitacora.db`
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub session_secret: Option<String>,
    pub admin_password: Option<String>,
}

impl Config {
    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn extracts_dir(&self) -> PathBuf {
        self.data_dir.join("extracts")
    }

    /// Create the data and extracts directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        let extracts = self.extracts_dir();
        std::fs::create_dir_all(&extracts)
            .with_context(|| format!("Failed to create {}", extracts.display()))?;
        Ok(())
    }

    /// Session key from the configured secret, or a per-process random key
    pub fn session_key(&self) -> SessionKey {
        match self.session_secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => SessionKey::derive(secret),
            _ => {
                warn!("BITACORA_SESSION_SECRET not set, sessions will not survive a restart");
                SessionKey::random()
            }
        }
    }
}
