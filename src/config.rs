use std::env;

/// Process-wide configuration, built once in `main` and managed as Rocket
/// state. The signing secret is injected into the identity code from here,
/// never read from ambient globals.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub secret: String,
    pub token_ttl_days: i64,
}

const DEFAULT_TOKEN_TTL_DAYS: i64 = 7;

impl AppConfig {
    pub fn from_env() -> Result<AppConfig, env::VarError> {
        let token_ttl_days = env::var("TOKEN_TTL_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TOKEN_TTL_DAYS);

        Ok(AppConfig {
            database_url: env::var("DATABASE_URL")?,
            secret: env::var("SECRET_KEY")?,
            token_ttl_days,
        })
    }
}
