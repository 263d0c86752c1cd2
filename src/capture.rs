use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt};

use crate::error::QueueError;
use crate::queue::Queue;

/// One unit of media produced by the capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    pub payload: Bytes,
}

impl CapturedChunk {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Append every chunk of `chunks` to `queue`, in order
///
/// Returns the number of chunks accepted. Stops at the first error; an empty
/// chunk yields [`QueueError::StaleCapture`].
pub async fn ingest<S>(queue: &Mutex<Queue>, chunks: S) -> Result<u64, QueueError>
where
    S: Stream<Item = CapturedChunk>,
{
    tokio::pin!(chunks);
    let mut accepted = 0;
    while let Some(chunk) = chunks.next().await {
        if queue.lock().await.handle_chunk(chunk.payload).await?.is_some() {
            accepted += 1;
        }
    }
    Ok(accepted)
}
