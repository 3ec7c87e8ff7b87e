use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::collab::SessionConfig;

/// Collaborative learning-path diagram server
#[derive(Parser, Clone, Debug)]
#[command(name = "pathsync", version, about = "Collaborative learning-path diagram server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3001")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "data/pathsync.db")]
    pub database_path: PathBuf,

    /// Extra allowed CORS origins, comma separated. Localhost is always allowed.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// HS256 secret for access tokens. Required unless auth is disabled.
    #[arg(long, env = "AUTH_JWT_SECRET", hide_env_values = true)]
    pub auth_jwt_secret: Option<String>,

    /// Run without authentication; every caller is the local dev user
    #[arg(long = "no-auth", env = "AUTH_DISABLED")]
    pub auth_disabled: bool,

    /// Emails granted admin rights, comma separated
    #[arg(long, env = "ADMIN_EMAILS", value_delimiter = ',')]
    pub admin_emails: Vec<String>,

    /// Interval between session flushes, in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "2000")]
    pub flush_interval_ms: u64,

    /// Enable structured JSON logging
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

/// Attempts to open the store at startup before giving up.
pub const STARTUP_STORE_ATTEMPTS: u32 = 5;

/// Fixed delay between startup store attempts.
pub const STARTUP_STORE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("AUTH_JWT_SECRET is not set; pass --no-auth (AUTH_DISABLED=true) to run without authentication")]
    MissingSecret,
    #[error("--no-auth conflicts with AUTH_JWT_SECRET")]
    ConflictingAuth,
}

impl Config {
    /// Auth settings. A missing secret is an error unless auth was turned off
    /// explicitly.
    pub fn auth(&self) -> Result<AuthConfig, ConfigError> {
        let secret = self.auth_jwt_secret.as_deref().filter(|s| !s.is_empty());
        match (secret, self.auth_disabled) {
            (Some(secret), false) => Ok(AuthConfig::with_secret(
                secret.as_bytes().to_vec(),
                self.admin_emails.clone(),
            )),
            (None, true) => Ok(AuthConfig::disabled()),
            (None, false) => Err(ConfigError::MissingSecret),
            (Some(_), true) => Err(ConfigError::ConflictingAuth),
        }
    }

    pub fn sessions(&self) -> SessionConfig {
        SessionConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            ..SessionConfig::default()
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .iter()
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
