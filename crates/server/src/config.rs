use std::time::Duration;

use anyhow::Context;
use livekit_integration::LiveKitConfig;
use serde::Deserialize;
use server_api::CallPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub livekit_api_key: String,
    pub livekit_api_secret: String,
    pub livekit_url: Option<String>,
    pub livekit_ttl_seconds: i64,
    pub call_ring_timeout_seconds: u64,
    pub initiate_dedup_window_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            livekit_api_key: "devkey".into(),
            livekit_api_secret: "devsecret".into(),
            livekit_url: None,
            livekit_ttl_seconds: 3600,
            call_ring_timeout_seconds: 30,
            initiate_dedup_window_seconds: 10,
        }
    }
}

impl Settings {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.call_ring_timeout_seconds)
    }

    pub fn livekit(&self) -> LiveKitConfig {
        LiveKitConfig {
            api_key: self.livekit_api_key.clone(),
            api_secret: self.livekit_api_secret.clone(),
            ttl_seconds: self.livekit_ttl_seconds,
        }
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            initiate_dedup_window: chrono::Duration::seconds(self.initiate_dedup_window_seconds),
        }
    }
}

/// Defaults, then `server.{toml,json,..}` if present, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<Settings> {
    build_settings(
        "server",
        config::Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true),
    )
}

fn build_settings(file: &str, env: config::Environment) -> anyhow::Result<Settings> {
    let mut settings: Settings = config::Config::builder()
        .add_source(config::File::with_name(file).required(false))
        .add_source(env)
        .build()
        .context("failed to read server configuration")?
        .try_deserialize()
        .context("invalid server configuration")?;
    settings.database_url = normalize_database_url(&settings.database_url);
    if settings.call_ring_timeout_seconds == 0 {
        anyhow::bail!("call_ring_timeout_seconds must be positive");
    }
    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
