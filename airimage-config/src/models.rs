use anyhow::Context;
use airimage_core::{CacheSettings, CallbackContext};
use serde::{Deserialize, Serialize};
use std::{
    env,
    path::{Path, PathBuf},
};
use url::Url;

use crate::loader::{self, Format};

pub const CONFIG_PATH_ENV: &str = "AIRIMAGE_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "AIRIMAGE_CONFIG_JSON";

/// Source that produced the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Everything an application needs to stand up its image cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AirImageConfig {
    /// Tier tuning: cache directory, fetch timeout, memory budget, disk
    /// quality and the optional low-memory monitor.
    pub cache: CacheSettings,
    /// Keys are joined onto this URL to form fetch URLs. Without it the
    /// network tier is disabled and misses stay misses.
    pub base_url: Option<Url>,
    /// Filter used when `RUST_LOG` is unset, e.g.
    /// `"info,airimage_core=debug"`.
    pub log_filter: Option<String>,
    /// Where completions run: `"dedicated"` (own thread) or `"manual"`
    /// (pumped by the application).
    pub callback_context: CallbackContext,
}

impl AirImageConfig {
    /// Load configuration using environment variables.
    /// Evaluation order:
    /// 1) `$AIRIMAGE_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$AIRIMAGE_CONFIG_JSON` (inline JSON),
    /// 3) the first of `airimage.toml`, `airimage.json`,
    ///    `config/airimage.toml`, `config/airimage.json` that exists,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        loader::read(path)
    }

    /// Parses TOML, falling back to JSON.
    pub fn parse_from_str(
        contents: &str,
        origin: &str,
    ) -> anyhow::Result<Self> {
        Format::Sniff.parse(contents, origin)
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        Format::Json.parse(raw, "(inline)")
    }

    pub fn find_default_file() -> Option<PathBuf> {
        Self::find_default_file_in(Path::new("."))
    }

    /// Like [`find_default_file`](Self::find_default_file), relative to `dir`.
    pub fn find_default_file_in(dir: &Path) -> Option<PathBuf> {
        loader::first_existing(
            dir,
            &[
                "airimage.toml",
                "airimage.json",
                "config/airimage.toml",
                "config/airimage.json",
            ],
        )
    }

    pub fn log_filter_or_default(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or(crate::logging::DEFAULT_FILTER)
    }
}
