use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// `None` runs the server on the in-memory store.
    pub database_url: Option<String>,
    pub public_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub completion_timeout: Duration,
    pub engine_timeout: Duration,
    pub admin_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match var("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        let public_base_url = var("API_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            port,
            database_url: resolve_database_url(&var),
            public_base_url,
            gemini_api_key: var("GEMINI_API_KEY").or_else(|| var("API_KEY")),
            gemini_base_url: var("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            completion_timeout: seconds(
                &var,
                "COMPLETION_TIMEOUT_SECS",
                DEFAULT_COMPLETION_TIMEOUT_SECS,
            )?,
            engine_timeout: seconds(&var, "ENGINE_TIMEOUT_SECS", DEFAULT_ENGINE_TIMEOUT_SECS)?,
            admin_token: var("ADMIN_TOKEN"),
        })
    }
}

fn seconds(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match var(key) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
        None => Ok(Duration::from_secs(default)),
    }
}

fn resolve_database_url(var: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = var("DATABASE_URL") {
        return Some(url);
    }
    let host = var("POSTGRES_HOST").or_else(|| var("PGHOST"))?;
    let port = var("POSTGRES_PORT")
        .or_else(|| var("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER")
        .or_else(|| var("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = var("POSTGRES_PASSWORD")
        .or_else(|| var("PGPASSWORD"))
        .unwrap_or_default();
    let db = var("POSTGRES_DB")
        .or_else(|| var("PGDATABASE"))
        .unwrap_or_else(|| "widget_server".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}
