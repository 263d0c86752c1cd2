use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Credentials file structure
///
/// Format:
/// ```toml
/// [sftp.profile_name]
/// password = "your_sftp_password_here"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub sftp: HashMap<String, CredentialProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialProfile {
    pub password: String,
}

/// Default credentials file path: ~/.config/resumable_media_upload/credentials.toml
pub fn default_credentials_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME")
        .map_err(|_| ConfigError::Credentials("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("resumable_media_upload")
        .join("credentials.toml"))
}

/// Load credentials from `path`
/// Returns None if the file doesn't exist
pub fn load_credentials(path: &Path) -> Result<Option<Credentials>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let credentials: Credentials = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Some(credentials))
}

/// Get the SFTP password for a profile
pub fn get_password(
    credentials: &Option<Credentials>,
    profile: &str,
    path: &Path,
) -> Result<String, ConfigError> {
    match credentials {
        Some(creds) => creds
            .sftp
            .get(profile)
            .map(|p| p.password.clone())
            .ok_or_else(|| {
                ConfigError::Credentials(format!(
                    "Credential profile '[sftp.{}]' not found in credentials file",
                    profile
                ))
            }),
        None => Err(ConfigError::Credentials(format!(
            "Credentials file not found. Expected at: {}",
            path.display()
        ))),
    }
}
