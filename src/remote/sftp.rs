use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use ssh2::{Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use super::{BlobStore, ConcatOutput};
use crate::config::SftpStoreConfig;
use crate::constants::generate_request_id;
use crate::credentials;
use crate::error::{ConfigError, RemoteError, RemoteResult};

/// SFTP-specific errors
#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Remote file error '{}': {}", .0.display(), .1)]
    RemoteFile(PathBuf, String),
    #[error("Directory error '{}': {}", .0.display(), .1)]
    Directory(PathBuf, String),
    #[error("Size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SSH2 error: {0}")]
    Ssh2(#[from] ssh2::Error),
}

pub type Result<T> = std::result::Result<T, SftpError>;

impl From<SftpError> for RemoteError {
    fn from(err: SftpError) -> Self {
        match &err {
            SftpError::ConnectionFailed(_) | SftpError::Io(_) | SftpError::Ssh2(_) => {
                RemoteError::Network(err.to_string())
            }
            SftpError::AuthenticationFailed(_) => RemoteError::CredentialsExpired(err.to_string()),
            SftpError::SizeMismatch { .. } => RemoteError::remote(err.to_string(), true),
            SftpError::RemoteFile(..) | SftpError::Directory(..) => {
                RemoteError::remote(err.to_string(), false)
            }
        }
    }
}

/// Authentication method for SFTP
#[derive(Debug, Clone)]
pub enum SftpAuth {
    Password(String),
    /// Private key file with optional passphrase
    KeyFile(PathBuf, Option<String>),
}

/// Everything needed to open one SFTP connection
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SftpAuth,
}

/// Blocking SFTP client; one connection per instance
pub struct SftpClient {
    session: Session,
    sftp: Sftp,
}

impl SftpClient {
    pub fn connect(settings: &SftpSettings) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);

        let tcp = TcpStream::connect(&addr).map_err(|e| {
            SftpError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        match &settings.auth {
            SftpAuth::Password(password) => {
                session
                    .userauth_password(&settings.username, password)
                    .map_err(|e| {
                        SftpError::AuthenticationFailed(format!(
                            "Password authentication failed for user '{}': {}",
                            settings.username, e
                        ))
                    })?;
            }
            SftpAuth::KeyFile(key_path, passphrase) => {
                session
                    .userauth_pubkey_file(&settings.username, None, key_path, passphrase.as_deref())
                    .map_err(|e| {
                        SftpError::AuthenticationFailed(format!(
                            "Key-based authentication failed for user '{}' with key '{}': {}",
                            settings.username,
                            key_path.display(),
                            e
                        ))
                    })?;
            }
        }

        if !session.authenticated() {
            return Err(SftpError::AuthenticationFailed(
                "Authentication failed (session not authenticated)".to_string(),
            ));
        }

        let sftp = session.sftp()?;
        Ok(Self { session, sftp })
    }

    /// Create a directory recursively, like `mkdir -p`
    pub fn mkdir_p(&self, path: &Path, permissions: i32) -> Result<()> {
        let mut current = PathBuf::new();

        for component in path.components() {
            current.push(component);

            if self.sftp.mkdir(&current, permissions).is_err() {
                match self.sftp.stat(&current) {
                    Ok(stat) if stat.is_dir() => {}
                    Ok(_) => {
                        return Err(SftpError::Directory(
                            current.clone(),
                            "Path exists but is not a directory".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(SftpError::Directory(
                            current.clone(),
                            format!("Failed to create directory: {}", e),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Write `data` to `remote_path` through a `.tmpupload` file and a rename,
    /// so readers never observe a partial object
    pub fn upload_bytes(&self, data: &[u8], remote_path: &Path) -> Result<()> {
        let temp_path = PathBuf::from(format!("{}.tmpupload", remote_path.display()));

        if let Some(parent) = temp_path.parent() {
            if !parent.as_os_str().is_empty() {
                self.mkdir_p(parent, 0o755)?;
            }
        }

        let mut remote_file = self
            .sftp
            .open_mode(
                &temp_path,
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
                0o644,
                ssh2::OpenType::File,
            )
            .map_err(|e| {
                SftpError::RemoteFile(temp_path.clone(), format!("Failed to create remote file: {}", e))
            })?;

        remote_file.write_all(data).map_err(|e| {
            SftpError::RemoteFile(temp_path.clone(), format!("Failed to write to remote file: {}", e))
        })?;
        remote_file.flush().map_err(|e| {
            SftpError::RemoteFile(temp_path.clone(), format!("Failed to flush remote file: {}", e))
        })?;
        drop(remote_file);

        let expected = data.len() as u64;
        let actual = self.stat(&temp_path)?.size.unwrap_or(0);
        if actual != expected {
            let _ = self.sftp.unlink(&temp_path);
            return Err(SftpError::SizeMismatch { expected, actual });
        }

        self.sftp.rename(&temp_path, remote_path, None).map_err(|e| {
            SftpError::RemoteFile(
                remote_path.to_path_buf(),
                format!("Failed to rename temp file to final path: {}", e),
            )
        })?;

        Ok(())
    }

    pub fn stat(&self, path: &Path) -> Result<ssh2::FileStat> {
        self.sftp.stat(path).map_err(|e| {
            SftpError::RemoteFile(path.to_path_buf(), format!("Failed to stat file: {}", e))
        })
    }

    /// Read a whole remote file into memory
    pub fn download_file(&self, remote_path: &Path) -> Result<Vec<u8>> {
        let mut remote_file = self.sftp.open(remote_path).map_err(|e| {
            SftpError::RemoteFile(
                remote_path.to_path_buf(),
                format!("Failed to open remote file: {}", e),
            )
        })?;

        let mut buffer = Vec::new();
        remote_file.read_to_end(&mut buffer).map_err(|e| {
            SftpError::RemoteFile(
                remote_path.to_path_buf(),
                format!("Failed to read remote file: {}", e),
            )
        })?;

        Ok(buffer)
    }

    pub fn remove_file(&self, remote_path: &Path) -> Result<()> {
        self.sftp.unlink(remote_path).map_err(|e| {
            SftpError::RemoteFile(
                remote_path.to_path_buf(),
                format!("Failed to remove file: {}", e),
            )
        })
    }

    pub fn disconnect(self) -> Result<()> {
        drop(self.sftp);
        self.session.disconnect(None, "Closing connection", None)?;
        Ok(())
    }
}

/// [`BlobStore`] over SFTP
///
/// Each operation opens its own connection on the blocking pool. Stitching
/// downloads the chunk objects in order and uploads their concatenation.
pub struct SftpBlobStore {
    config: SftpStoreConfig,
    credentials_path: PathBuf,
    auth: RwLock<SftpAuth>,
}

impl SftpBlobStore {
    pub fn from_config(
        config: &SftpStoreConfig,
        credentials_path: &Path,
    ) -> std::result::Result<Self, ConfigError> {
        let auth = resolve_auth(config, credentials_path)?;
        Ok(Self {
            config: config.clone(),
            credentials_path: credentials_path.to_path_buf(),
            auth: RwLock::new(auth),
        })
    }

    /// Absolute location of a store-relative path on the server
    pub fn remote_path(&self, path: &str) -> PathBuf {
        Path::new(&self.config.remote_dir).join(path.trim_start_matches('/'))
    }

    /// URL for `path`, under `public_url_base` when configured
    pub fn public_url(&self, path: &str) -> RemoteResult<String> {
        let relative = path.trim_start_matches('/');
        match &self.config.public_url_base {
            Some(base) => {
                let base = if base.ends_with('/') {
                    base.clone()
                } else {
                    format!("{}/", base)
                };
                Url::parse(&base)
                    .and_then(|u| u.join(relative))
                    .map(|u| u.to_string())
                    .map_err(|e| {
                        RemoteError::remote(format!("Invalid public URL for '{}': {}", path, e), false)
                    })
            }
            None => {
                let full = self.remote_path(relative);
                let full = full.to_string_lossy();
                Ok(format!(
                    "sftp://{}@{}:{}/{}",
                    self.config.username,
                    self.config.host,
                    self.config.port,
                    full.trim_start_matches('/')
                ))
            }
        }
    }

    async fn settings(&self) -> SftpSettings {
        SftpSettings {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            auth: self.auth.read().await.clone(),
        }
    }

    async fn run<T, F>(&self, op: F) -> RemoteResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpClient) -> Result<T> + Send + 'static,
    {
        let settings = self.settings().await;
        let joined = tokio::task::spawn_blocking(move || {
            let client = SftpClient::connect(&settings)?;
            let result = op(&client);
            if let Err(e) = client.disconnect() {
                debug!("SFTP disconnect failed: {}", e);
            }
            result
        })
        .await
        .map_err(|e| RemoteError::remote(format!("SFTP worker failed: {}", e), true))?;
        joined.map_err(RemoteError::from)
    }
}

fn resolve_auth(
    config: &SftpStoreConfig,
    credentials_path: &Path,
) -> std::result::Result<SftpAuth, ConfigError> {
    if let Some(key_file) = &config.key_file {
        return Ok(SftpAuth::KeyFile(key_file.clone(), None));
    }
    let profile = config.credential_profile.as_deref().ok_or_else(|| {
        ConfigError::Invalid("[sftp] needs either credential_profile or key_file".to_string())
    })?;
    let creds = credentials::load_credentials(credentials_path)?;
    let password = credentials::get_password(&creds, profile, credentials_path)?;
    Ok(SftpAuth::Password(password))
}

#[async_trait]
impl BlobStore for SftpBlobStore {
    async fn upload(&self, path: &str, data: Bytes) -> RemoteResult<String> {
        let target = self.remote_path(path);
        let size = data.len();
        self.run(move |client| client.upload_bytes(&data, &target))
            .await?;
        debug!("Uploaded {} bytes to {}", size, path);
        Ok(path.to_string())
    }

    async fn sign(&self, path: &str) -> RemoteResult<String> {
        let target = self.remote_path(path);
        self.run(move |client| client.stat(&target).map(|_| ()))
            .await?;
        self.public_url(path)
    }

    async fn concat(
        &self,
        path: &str,
        keys: &[String],
        content_type: &str,
    ) -> RemoteResult<ConcatOutput> {
        let request_id = generate_request_id();
        let sources: Vec<PathBuf> = keys.iter().map(|k| self.remote_path(k)).collect();
        let target = self.remote_path(path);
        info!(
            "Stitching {} objects into {} ({}, request {})",
            sources.len(),
            path,
            content_type,
            request_id
        );

        let failed_request = request_id.clone();
        self.run(move |client| {
            let mut stitched = Vec::new();
            for source in &sources {
                stitched.extend(client.download_file(source)?);
            }
            client.upload_bytes(&stitched, &target)
        })
        .await
        .map_err(|err| match err {
            RemoteError::Remote {
                message, retryable, ..
            } => RemoteError::Remote {
                message,
                retryable,
                request_id: Some(failed_request),
            },
            other => other,
        })?;

        Ok(ConcatOutput {
            result_path: path.to_string(),
            request_id,
        })
    }

    async fn refresh_credentials(&self) -> RemoteResult<()> {
        let auth = resolve_auth(&self.config, &self.credentials_path)
            .map_err(|e| RemoteError::remote(e.to_string(), false))?;
        *self.auth.write().await = auth;
        info!("Reloaded SFTP credentials for {}", self.config.username);
        Ok(())
    }
}
