//! Application configuration

use std::env;
use std::time::Duration;

/// Minimum length for shared secrets
const MIN_SECRET_LEN: usize = 32;

/// Which ledger backend the server runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    /// Process-local ledger for local runs; nothing survives a restart
    Memory,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,
    pub max_request_body_bytes: usize,

    // Database
    pub ledger_backend: LedgerBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Authentication
    pub gateway_token: String,

    // Webhooks
    pub webhook_deadline: Duration,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let ledger_backend = match env::var("LEDGER_BACKEND").as_deref() {
            Ok("memory") => LedgerBackend::Memory,
            Ok("postgres") | Err(_) => LedgerBackend::Postgres,
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    var: "LEDGER_BACKEND",
                    reason: format!("expected postgres or memory, got {}", other),
                })
            }
        };

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        if ledger_backend == LedgerBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_request_body_bytes: parse_or("MAX_REQUEST_BODY_BYTES", 1024 * 1024)?,

            // Database
            ledger_backend,
            database_url,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 20)?,
            run_migrations: parse_or("RUN_MIGRATIONS", true)?,

            // Authentication
            gateway_token: {
                let token =
                    env::var("GATEWAY_TOKEN").map_err(|_| ConfigError::Missing("GATEWAY_TOKEN"))?;
                if token.len() < MIN_SECRET_LEN {
                    return Err(ConfigError::WeakSecret(
                        "GATEWAY_TOKEN must be at least 32 characters",
                    ));
                }
                token
            },

            // Webhooks
            webhook_deadline: Duration::from_millis(parse_or("WEBHOOK_DEADLINE_MS", 10_000u64)?),

            // Logging
            log_json: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
        })
    }
}

/// Parse an optional variable, keeping the default when unset
fn parse_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
