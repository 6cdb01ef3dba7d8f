use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub auth_secret: String,
    pub sweep_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/social.db".into(),
            auth_secret: "devsecret".into(),
            sweep_interval_seconds: 300,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("auth_secret") {
                settings.auth_secret = v.clone();
            }
            if let Some(parsed) = file_cfg
                .get("sweep_interval_seconds")
                .and_then(|v| v.parse::<u64>().ok())
            {
                settings.sweep_interval_seconds = parsed;
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("AUTH_SECRET") {
        settings.auth_secret = v;
    }
    if let Ok(v) = std::env::var("APP__AUTH_SECRET") {
        settings.auth_secret = v;
    }

    if let Ok(v) = std::env::var("APP__SWEEP_INTERVAL_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.sweep_interval_seconds = parsed;
        }
    }

    settings
}

/// Normalizes the configured database location and makes sure the
/// directory holding a file-backed database exists before sqlx opens it.
pub fn prepare_database_url(raw: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw);
    if let Some(path) = sqlite_file_path(&database_url) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory '{}'", parent.display())
            })?;
        }
    }
    Ok(database_url)
}

/// Accepts a bare file path or `sqlite:` shorthand for the sqlite url.
fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().database_url;
    }
    if raw == "sqlite::memory:" || raw.contains("://") {
        return raw.to_string();
    }
    format!("sqlite://{}", raw.trim_start_matches("sqlite:"))
}

fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")?
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}
