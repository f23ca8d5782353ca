use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::protocol::Targeting;
use thiserror::Error;

use crate::endpoints::Endpoints;

pub const DEFAULT_SETTINGS_FILE: &str = "perks.toml";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) perks-client";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse settings file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub offers_path: String,
    pub session_path: String,
    pub request_timeout_secs: u64,
    pub targeting: Targeting,
    /// `None` keeps every entry for the lifetime of the session.
    pub activity_log_capacity: Option<usize>,
    /// Queue toggles of the same campaign behind the one in flight.
    pub serialize_toggles: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api-staging.adspostx.com".into(),
            offers_path: "/native/v2/offers.json".into(),
            session_path: "/sdk/v4/usp".into(),
            request_timeout_secs: 30,
            targeting: Targeting {
                placement: "in-app".into(),
                user_agent: DEFAULT_USER_AGENT.into(),
                ip: "auto".into(),
                fingerprint: "demo_fingerprint".into(),
                country: "us".into(),
                dev: 1,
            },
            activity_log_capacity: None,
            serialize_toggles: true,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn endpoints(&self) -> Result<Endpoints, SettingsError> {
        Endpoints::new(&self.api_base_url, &self.offers_path, &self.session_path)
            .map_err(SettingsError::InvalidBaseUrl)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    api_base_url: Option<String>,
    offers_path: Option<String>,
    session_path: Option<String>,
    request_timeout_secs: Option<u64>,
    placement: Option<String>,
    user_agent: Option<String>,
    ip: Option<String>,
    fingerprint: Option<String>,
    country: Option<String>,
    dev: Option<u8>,
    activity_log_capacity: Option<usize>,
    serialize_toggles: Option<bool>,
}

/// Defaults, then `perks.toml` in the working directory if present, then the
/// process environment.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from(None)
}

/// Like [`load_settings`], but an explicit path must exist.
pub fn load_settings_from(path: Option<&Path>) -> Result<ClientSettings, SettingsError> {
    let mut settings = ClientSettings::default();

    let raw = match path {
        Some(path) => Some((
            path.to_path_buf(),
            fs::read_to_string(path).map_err(|source| SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })?,
        )),
        None => fs::read_to_string(DEFAULT_SETTINGS_FILE)
            .ok()
            .map(|raw| (PathBuf::from(DEFAULT_SETTINGS_FILE), raw)),
    };
    if let Some((path, raw)) = raw {
        let file = toml::from_str::<SettingsFile>(&raw)
            .map_err(|source| SettingsError::Parse { path, source })?;
        apply_file(&mut settings, file);
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    settings.endpoints()?;
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, file: SettingsFile) {
    if let Some(v) = file.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file.offers_path {
        settings.offers_path = v;
    }
    if let Some(v) = file.session_path {
        settings.session_path = v;
    }
    if let Some(v) = file.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file.placement {
        settings.targeting.placement = v;
    }
    if let Some(v) = file.user_agent {
        settings.targeting.user_agent = v;
    }
    if let Some(v) = file.ip {
        settings.targeting.ip = v;
    }
    if let Some(v) = file.fingerprint {
        settings.targeting.fingerprint = v;
    }
    if let Some(v) = file.country {
        settings.targeting.country = v;
    }
    if let Some(v) = file.dev {
        settings.targeting.dev = v;
    }
    if file.activity_log_capacity.is_some() {
        settings.activity_log_capacity = file.activity_log_capacity;
    }
    if let Some(v) = file.serialize_toggles {
        settings.serialize_toggles = v;
    }
}

fn apply_env(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), SettingsError> {
    if let Some(v) = lookup("PERKS_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = lookup("PERKS_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_env("PERKS_TIMEOUT_SECS", &v)?;
    }

    if let Some(v) = lookup("PERKS_PLACEMENT") {
        settings.targeting.placement = v;
    }
    if let Some(v) = lookup("PERKS_COUNTRY") {
        settings.targeting.country = v;
    }

    if let Some(v) = lookup("PERKS_LOG_CAPACITY") {
        settings.activity_log_capacity = if v.trim().is_empty() || v.trim() == "0" {
            None
        } else {
            Some(parse_env("PERKS_LOG_CAPACITY", &v)?)
        };
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
