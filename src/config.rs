use anyhow::Context;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let max_connections = match lookup("CRM_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("CRM_MAX_CONNECTIONS must be a positive integer, got '{raw}'"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let log_format = match lookup("CRM_LOG_FORMAT") {
            Some(raw) if raw.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            max_connections,
            log_format,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}
