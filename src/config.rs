//! Device identity and runtime settings loaded from the environment.

use crate::error::{DeviceError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_ID_SCOPE: &str = "DPS_ID_SCOPE";
pub const ENV_DEVICE_ID: &str = "DPS_DEVICE_ID";
pub const ENV_DEVICE_KEY: &str = "DPS_DEVICE_KEY";
pub const ENV_PROVISIONING_HOST: &str = "DPS_PROVISIONING_HOST";
pub const ENV_TELEMETRY_INTERVAL: &str = "TELEMETRY_INTERVAL_SECS";

pub const DEFAULT_PROVISIONING_HOST: &str = "global.azure-devices-provisioning.net";
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(8);

/// Identity presented to the provisioning service.
///
/// Only the scope changes during the lifetime of the process, once per
/// accepted migration command.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub scope_id: String,
    pub registration_id: String,
    pub symmetric_key: String,
}

// Keeps the key out of logs.
impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("scope_id", &self.scope_id)
            .field("registration_id", &self.registration_id)
            .field("symmetric_key", &"<redacted>")
            .finish()
    }
}

impl DeviceIdentity {
    pub fn new<S, R, K>(scope_id: S, registration_id: R, symmetric_key: K) -> Self
    where
        S: Into<String>,
        R: Into<String>,
        K: Into<String>,
    {
        Self {
            scope_id: scope_id.into(),
            registration_id: registration_id.into(),
            symmetric_key: symmetric_key.into(),
        }
    }

    /// Reads `DPS_ID_SCOPE`, `DPS_DEVICE_ID` and `DPS_DEVICE_KEY`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the identity from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            scope_id: required(&lookup, ENV_ID_SCOPE)?,
            registration_id: required(&lookup, ENV_DEVICE_ID)?,
            symmetric_key: required(&lookup, ENV_DEVICE_KEY)?,
        })
    }
}

/// Optional tunables with defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub provisioning_host: String,
    pub telemetry_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provisioning_host: DEFAULT_PROVISIONING_HOST.to_string(),
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(host) = non_empty(&lookup, ENV_PROVISIONING_HOST) {
            settings.provisioning_host = host;
        }

        if let Some(raw) = non_empty(&lookup, ENV_TELEMETRY_INTERVAL) {
            let secs = raw.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                DeviceError::Configuration(format!(
                    "{} must be a positive number of seconds, got '{}'",
                    ENV_TELEMETRY_INTERVAL, raw
                ))
            })?;
            settings.telemetry_interval = Duration::from_secs(secs);
        }

        Ok(settings)
    }
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name).ok_or_else(|| {
        DeviceError::Configuration(format!("missing required environment variable {}", name))
    })
}

/// Loads `.env` from the working directory or its parents.
///
/// Returns the file that was read, or `None` when there is no such file.
/// A file that exists but cannot be parsed is a configuration error.
pub fn load_env_file() -> Result<Option<PathBuf>> {
    env_file_outcome(dotenvy::dotenv())
}

/// Same as [`load_env_file`] for an explicit path.
pub fn load_env_file_from(path: &Path) -> Result<Option<PathBuf>> {
    env_file_outcome(dotenvy::from_path(path).map(|()| path.to_path_buf()))
}

fn env_file_outcome(loaded: dotenvy::Result<PathBuf>) -> Result<Option<PathBuf>> {
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(DeviceError::Configuration(format!("invalid .env file: {}", e))),
    }
}
