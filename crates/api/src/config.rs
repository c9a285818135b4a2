//! Server configuration loaded from the environment

use anyhow::{bail, Context};

/// Where credit balances live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local store; state is lost on restart
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("Invalid CREDIT_STORE '{}': expected postgres or memory", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Required for the postgres backend
    pub database_url: Option<String>,
    pub credit_store: StoreBackend,
    pub run_migrations: bool,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub allowed_origins: Vec<String>,
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let credit_store = match std::env::var("CREDIT_STORE") {
            Ok(raw) => raw.parse()?,
            Err(_) => StoreBackend::Postgres,
        };

        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        if credit_store == StoreBackend::Postgres && database_url.is_none() {
            bail!("DATABASE_URL must be set when CREDIT_STORE=postgres");
        }

        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 32 {
            tracing::warn!("JWT_SECRET is shorter than 32 bytes");
        }

        let jwt_expiry_hours = match std::env::var("JWT_EXPIRY_HOURS") {
            Ok(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .with_context(|| format!("Invalid JWT_EXPIRY_HOURS '{}'", raw))?,
            Err(_) => 24,
        };

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5000,http://127.0.0.1:5000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            database_url,
            credit_store,
            run_migrations: env_flag("RUN_MIGRATIONS", true),
            jwt_secret,
            jwt_expiry_hours,
            allowed_origins,
            enable_billing: env_flag("ENABLE_BILLING", true),
        })
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!(name = name, value = %raw, default = default, "Ignoring invalid boolean");
                default
            }
        },
        Err(_) => default,
    }
}
