//! Server configuration loaded from the environment

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret used by Supabase to sign access tokens
    pub supabase_jwt_secret: String,
    /// Shared key for `/internal` routes; those routes answer 503 when unset
    pub internal_api_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let supabase_jwt_secret = required("SUPABASE_JWT_SECRET")?;

        let bind_address = optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.into());
        let internal_api_key = optional("INTERNAL_API_KEY");

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            supabase_jwt_secret,
            internal_api_key,
            allowed_origins,
            run_migrations: flag("RUN_MIGRATIONS", true)?,
            enable_billing: flag("ENABLE_BILLING", true)?,
        })
    }
}

// Secrets stay out of logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[redacted]")
            .field("bind_address", &self.bind_address)
            .field("supabase_jwt_secret", &"[redacted]")
            .field("internal_api_key", &self.internal_api_key.as_ref().map(|_| "[redacted]"))
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .field("enable_billing", &self.enable_billing)
            .finish()
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}
