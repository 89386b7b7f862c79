//! Format-agnostic reading of serde config documents.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::de::DeserializeOwned;

/// Document format, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
    /// Unknown extension: TOML is tried first, then JSON.
    Sniff,
}

impl Format {
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Sniff,
        }
    }

    pub fn parse<T: DeserializeOwned>(
        self,
        contents: &str,
        origin: &str,
    ) -> anyhow::Result<T> {
        match self {
            Self::Toml => toml::from_str(contents)
                .map_err(|err| anyhow!("invalid config {origin}: {err}")),
            Self::Json => serde_json::from_str(contents)
                .map_err(|err| anyhow!("invalid config json {origin}: {err}")),
            Self::Sniff => sniff(contents, origin),
        }
    }
}

/// Reads `path` and decodes it in the format its extension names.
pub fn read<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!("failed to read config from {}", path.display())
    })?;
    Format::of(path).parse(&contents, &path.display().to_string())
}

fn sniff<T: DeserializeOwned>(
    contents: &str,
    origin: &str,
) -> anyhow::Result<T> {
    let toml_err = match toml::from_str(contents) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };
    serde_json::from_str(contents).map_err(|json_err| {
        anyhow!(
            "failed to parse config {origin}: \
             toml error: {toml_err}; json error: {json_err}"
        )
    })
}

/// First of `candidates`, relative to `dir`, that exists.
pub fn first_existing(dir: &Path, candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.exists())
}
