use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    jittered_interval_ms, LEASE_CHECK_INTERVAL_MS, LEASE_RENEW_INTERVAL_MS, LEASE_TTL_MS,
    PROCESS_INTERVAL_MS, PROCESS_JITTER_MS,
};
use crate::credentials::default_credentials_path;
use crate::error::ConfigError;
use crate::record::QueueKind;

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Upload pipeline configuration
    Upload,
}

fn default_store_id() -> String {
    "default".to_string()
}

fn default_sftp_port() -> u16 {
    22
}

/// Upload configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Configuration type (must be "upload")
    pub config_type: ConfigType,
    /// Directory holding the `recording_<id>.sqlite` stores
    pub store_dir: PathBuf,
    /// Store identifier used by the CLI (default: "default")
    #[serde(default = "default_store_id")]
    pub store_id: String,
    /// Credentials file (default: ~/.config/resumable_media_upload/credentials.toml)
    pub credentials_file: Option<PathBuf>,
    /// Remote store (maps to [sftp] section in TOML)
    pub sftp: SftpStoreConfig,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub paths: PathTemplates,
}

/// SFTP remote configuration (maps to [sftp] section in TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct SftpStoreConfig {
    /// SFTP server hostname or IP address
    pub host: String,
    /// SFTP server port (default: 22)
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    /// SFTP username for authentication
    pub username: String,
    /// Credential profile name to look up the password in the credentials file
    pub credential_profile: Option<String>,
    /// Private key used instead of a password
    pub key_file: Option<PathBuf>,
    /// Remote directory all object paths are relative to
    pub remote_dir: String,
    /// Public base URL the remote directory is served under
    pub public_url_base: Option<String>,
}

/// Lease and processing timings, in milliseconds (maps to [timings])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub lease_ttl_ms: i64,
    pub renew_interval_ms: u64,
    pub check_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub tick_jitter_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lease_ttl_ms: LEASE_TTL_MS,
            renew_interval_ms: LEASE_RENEW_INTERVAL_MS,
            check_interval_ms: LEASE_CHECK_INTERVAL_MS,
            tick_interval_ms: PROCESS_INTERVAL_MS,
            tick_jitter_ms: PROCESS_JITTER_MS,
        }
    }
}

impl Timings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_ms <= 0 {
            return Err(ConfigError::Invalid(
                "timings.lease_ttl_ms must be positive".to_string(),
            ));
        }
        if self.renew_interval_ms == 0 || self.check_interval_ms == 0 || self.tick_interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "timings intervals must be greater than zero".to_string(),
            ));
        }
        if self.renew_interval_ms as i64 >= self.lease_ttl_ms {
            return Err(ConfigError::Invalid(format!(
                "timings.renew_interval_ms ({}) must be shorter than lease_ttl_ms ({})",
                self.renew_interval_ms, self.lease_ttl_ms
            )));
        }
        Ok(())
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Delay before the next processing tick, jitter included
    pub fn next_tick_delay(&self) -> Duration {
        Duration::from_millis(jittered_interval_ms(
            self.tick_interval_ms,
            self.tick_jitter_ms,
        ))
    }
}

/// Remote path templates (maps to [paths]); `{draft_id}` and `{kind}` are substituted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathTemplates {
    pub upload_prefix: String,
    pub stitch_prefix: String,
}

impl Default for PathTemplates {
    fn default() -> Self {
        Self {
            upload_prefix: "{draft_id}/{kind}/chunks".to_string(),
            stitch_prefix: "{draft_id}/{kind}".to_string(),
        }
    }
}

impl PathTemplates {
    pub fn upload_path(&self, draft_id: &str, kind: QueueKind) -> String {
        render(&self.upload_prefix, draft_id, kind)
    }

    pub fn stitch_path(&self, draft_id: &str, kind: QueueKind) -> String {
        render(&self.stitch_prefix, draft_id, kind)
    }
}

fn render(template: &str, draft_id: &str, kind: QueueKind) -> String {
    template
        .replace("{draft_id}", draft_id)
        .replace("{kind}", kind.as_str())
}

impl UploadConfig {
    /// Read, parse and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: UploadConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_id.trim().is_empty() {
            return Err(ConfigError::Invalid("store_id must not be empty".to_string()));
        }
        if self.sftp.credential_profile.is_none() && self.sftp.key_file.is_none() {
            return Err(ConfigError::Invalid(
                "[sftp] needs either credential_profile or key_file".to_string(),
            ));
        }
        self.timings.validate()
    }

    pub fn credentials_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.credentials_file {
            Some(path) => Ok(path.clone()),
            None => default_credentials_path(),
        }
    }
}
