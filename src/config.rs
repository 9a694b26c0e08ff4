//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

const KEYRING_SERVICE: &str = "cloud-migration";

/// Connection settings for the remote migration service.
///
/// The API key is loaded at runtime via OS keychain or environment
/// variable, never from the TOML config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Base URL of the remote migration service.
    pub base_url: String,
    /// Per-request timeout applied by the HTTP transport.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// API key used to authenticate this instance (populated at runtime).
    #[serde(skip)]
    pub api_key: String,
}

/// Snapshot packaging and upload settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Upper bound on resources packaged into a single snapshot.
    #[serde(default = "default_max_resources")]
    pub max_resources_per_snapshot: usize,
    /// Size of each streamed upload chunk.
    #[serde(default = "default_chunk_bytes")]
    pub upload_chunk_bytes: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_resources_per_snapshot: default_max_resources(),
            upload_chunk_bytes: default_chunk_bytes(),
        }
    }
}

/// Migration run execution policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// Deadline for one background run, covering all its snapshots.
    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,
    /// Whether a session may have more than one run in progress.
    #[serde(default)]
    pub allow_concurrent_runs: bool,
    /// How long shutdown waits for in-flight runs to settle.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_run_timeout(),
            allow_concurrent_runs: false,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_resources() -> usize {
    500
}

fn default_chunk_bytes() -> usize {
    1024 * 1024
}

fn default_run_timeout() -> u64 {
    3600
}

fn default_shutdown_grace() -> u64 {
    10
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file.
    pub db_path: PathBuf,
    /// Root directory of exported resources, one `org_<id>` folder per organization.
    pub resource_root: PathBuf,
    /// Remote migration service connectivity.
    pub remote: RemoteConfig,
    /// Snapshot packaging settings.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Run execution policy.
    #[serde(default)]
    pub run: RunConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the remote API key from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide
    /// the key.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.remote.api_key = load_credential("remote_api_key", "CLOUD_MIGRATION_API_KEY").await?;
        Ok(())
    }

    /// Per-request timeout for the remote transport.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.request_timeout_seconds)
    }

    /// Deadline applied to each background run.
    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run.timeout_seconds)
    }

    /// Grace period granted to in-flight runs on shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.run.shutdown_grace_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            return Err(AppError::Config("remote.base_url must not be empty".into()));
        }
        if self.remote.request_timeout_seconds == 0 {
            return Err(AppError::Config(
                "remote.request_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.snapshot.max_resources_per_snapshot == 0 {
            return Err(AppError::Config(
                "snapshot.max_resources_per_snapshot must be greater than zero".into(),
            ));
        }
        if self.snapshot.upload_chunk_bytes == 0 {
            return Err(AppError::Config(
                "snapshot.upload_chunk_bytes must be greater than zero".into(),
            ));
        }
        if self.run.timeout_seconds == 0 {
            return Err(AppError::Config(
                "run.timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.run.shutdown_grace_seconds == 0 {
            return Err(AppError::Config(
                "run.shutdown_grace_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
