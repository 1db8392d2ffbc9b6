//! API server configuration

/// Default lifetime of payer bearer tokens issued by [`crate::auth::JwtManager`]
pub const DEFAULT_JWT_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Shared credential for `/internal/*`; empty disables those routes
    pub maintenance_secret: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("jwt_secret", &"[redacted]")
            .field("jwt_expiry_hours", &self.jwt_expiry_hours)
            .field("maintenance_secret", &"[redacted]")
            .field("allowed_origins", &self.allowed_origins)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;

        let jwt_expiry_hours = match std::env::var("JWT_EXPIRY_HOURS") {
            Ok(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| ConfigError::Invalid("JWT_EXPIRY_HOURS", raw))?,
            Err(_) => DEFAULT_JWT_EXPIRY_HOURS,
        };

        let maintenance_secret = std::env::var("MAINTENANCE_SECRET").unwrap_or_default();
        if maintenance_secret.is_empty() {
            tracing::warn!("MAINTENANCE_SECRET not set - maintenance endpoints are disabled");
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            jwt_secret,
            jwt_expiry_hours,
            maintenance_secret,
            allowed_origins,
            run_migrations,
        })
    }
}
