use std::{fs, io::ErrorKind, path::Path};

use anyhow::Context;
use recorder_core::DEFAULT_OUTCOME_CAPACITY;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub log_filter: String,
    pub fire_create_on_ready: bool,
    pub outcome_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/recorder.db".into(),
            log_filter: "info".into(),
            fire_create_on_ready: true,
            outcome_buffer: DEFAULT_OUTCOME_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    database_url: Option<String>,
    log_filter: Option<String>,
    fire_create_on_ready: Option<bool>,
    outcome_buffer: Option<usize>,
}

/// Defaults, then `path` if it exists, then environment variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.fire_create_on_ready {
        settings.fire_create_on_ready = v;
    }
    if let Some(v) = file_cfg.outcome_buffer {
        settings.outcome_buffer = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    if let Some(v) = lookup("APP__FIRE_CREATE_ON_READY") {
        if let Ok(parsed) = v.trim().parse::<bool>() {
            settings.fire_create_on_ready = parsed;
        }
    }

    if let Some(v) = lookup("APP__OUTCOME_BUFFER") {
        if let Ok(parsed) = v.trim().parse::<usize>() {
            settings.outcome_buffer = parsed;
        }
    }
}

/// Accepts bare file paths and `sqlite:` shorthands. Parent directories are
/// created by `Storage::new`.
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
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
