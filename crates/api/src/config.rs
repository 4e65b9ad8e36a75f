//! API server configuration

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (Supabase pooler URL in production).
    pub database_url: String,
    /// Redis connection string (Upstash URL in production).
    pub redis_url: String,
    /// Address the HTTP server binds to.
    pub bind_address: String,
    /// Supabase JWT signing secret for verifying user tokens.
    pub supabase_jwt_secret: String,
    /// Length of the trial window created on first authenticated use.
    pub trial_days: i64,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let supabase_jwt_secret = env::var("SUPABASE_JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("SUPABASE_JWT_SECRET must be set"))?;

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let bind_address = env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let trial_days = match env::var("TRIAL_DAYS") {
            Ok(raw) => raw
                .parse::<i64>()
                .map_err(|_| anyhow::anyhow!("TRIAL_DAYS must be an integer, got '{raw}'"))?,
            Err(_) => 7,
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            redis_url,
            bind_address,
            supabase_jwt_secret,
            trial_days,
            allowed_origins,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            database_url: "postgres://localhost/test".to_string(),
            redis_url: "redis://localhost".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            supabase_jwt_secret: "super-secret-jwt-token-with-at-least-32-characters".to_string(),
            trial_days: 7,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}
