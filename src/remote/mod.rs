//! Remote blob storage and the stitch (concatenation) service.

mod sftp;

pub use sftp::{SftpAuth, SftpBlobStore, SftpClient, SftpError, SftpSettings};

use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use serde::Serialize;
use std::future::Future;

use crate::error::{RemoteError, RemoteResult};
use crate::record::QueueKind;

/// Result of a successful concatenation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatOutput {
    pub result_path: String,
    pub request_id: String,
}

/// Stitched object handed back to the host on completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    pub path: String,
    pub url: String,
    pub kind: QueueKind,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path`, returning the stored path
    async fn upload(&self, path: &str, data: Bytes) -> RemoteResult<String>;

    /// Produce a URL under which `path` can be fetched
    async fn sign(&self, path: &str) -> RemoteResult<String>;

    /// Concatenate `keys` in order into a new object at `path`
    async fn concat(
        &self,
        path: &str,
        keys: &[String],
        content_type: &str,
    ) -> RemoteResult<ConcatOutput>;

    /// Obtain fresh credentials after the remote rejected the current ones
    async fn refresh_credentials(&self) -> RemoteResult<()>;
}

/// Run `op`, and if the credentials were rejected refresh them and run it once more
pub async fn retry_after_refresh<T, F, Fut>(store: &dyn BlobStore, mut op: F) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    match op().await {
        Err(RemoteError::CredentialsExpired(reason)) => {
            warn!("Credentials rejected ({}), refreshing", reason);
            store.refresh_credentials().await?;
            op().await
        }
        other => other,
    }
}
