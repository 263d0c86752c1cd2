//! Top-level entry point tying stores, the remote and queue runners together.

use dashmap::DashMap;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CapturedChunk};
use crate::clock::{Clock, SystemClock};
use crate::config::{PathTemplates, Timings, UploadConfig};
use crate::constants::QUEUE_OBJECT_TYPE;
use crate::error::{QueueError, ServiceError};
use crate::events::{self, QueueEvent, QueueProgress};
use crate::lease::{decode_timestamp, is_stale};
use crate::queue::{flush_queue_record, Queue, QueueDeps};
use crate::record::{flush_key, queue_key, FlushMarker, QueueKind, QueueRecord};
use crate::recovery::{RecoveryReport, RecoveryScanner};
use crate::remote::{BlobStore, SftpBlobStore};
use crate::runner::{QueueRunner, RunOutcome};
use crate::status::QueueStatus;
use crate::store::{KvStore, StoreRegistry};

pub type ServiceResult<T> = Result<T, ServiceError>;

type ActiveQueues = Arc<DashMap<String, CancellationToken>>;

/// Combined progress of every queue of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DraftProgress {
    pub status: QueueStatus,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: u8,
}

/// Fold per-queue progress into one figure
///
/// Any pending queue makes the draft pending, then stitching, then error;
/// otherwise the draft is done. Returns `None` while some queue has not
/// received any bytes yet.
pub fn aggregate_progress(items: &[QueueProgress]) -> Option<DraftProgress> {
    if items.is_empty() || items.iter().any(|p| p.total_bytes == 0) {
        return None;
    }

    let has = |status: QueueStatus| items.iter().any(|p| p.status == status);
    let status = if has(QueueStatus::Pending) {
        QueueStatus::Pending
    } else if has(QueueStatus::Stitching) {
        QueueStatus::Stitching
    } else if has(QueueStatus::Error) {
        QueueStatus::Error
    } else {
        QueueStatus::Done
    };

    let uploaded_bytes: u64 = items.iter().map(|p| p.uploaded_bytes).sum();
    let total_bytes: u64 = items.iter().map(|p| p.total_bytes).sum();
    let percentage = ((uploaded_bytes.saturating_mul(100)) / total_bytes).min(100) as u8;

    Some(DraftProgress {
        status,
        uploaded_bytes,
        total_bytes,
        percentage,
    })
}

/// A queue being driven by a background runner
pub struct RecordingSession {
    queue: Arc<Mutex<Queue>>,
    events: Option<mpsc::UnboundedReceiver<QueueEvent>>,
    cancel: CancellationToken,
    runner: JoinHandle<Result<RunOutcome, QueueError>>,
    active: ActiveQueues,
    active_key: String,
}

impl RecordingSession {
    pub fn queue(&self) -> Arc<Mutex<Queue>> {
        Arc::clone(&self.queue)
    }

    /// Event receiver; can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.events.take()
    }

    pub async fn push_chunk(&self, chunk: CapturedChunk) -> Result<Option<String>, QueueError> {
        self.queue.lock().await.handle_chunk(chunk.payload).await
    }

    pub async fn ingest<S>(&self, chunks: S) -> Result<u64, QueueError>
    where
        S: Stream<Item = CapturedChunk>,
    {
        capture::ingest(&self.queue, chunks).await
    }

    /// Recording finished; the runner drains and stitches what is left
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.queue.lock().await.mark_stopped().await
    }

    pub async fn progress(&self) -> QueueProgress {
        self.queue.lock().await.progress()
    }

    /// Cancel the runner and delete the recording's local and queued state
    pub async fn dismiss(self) -> ServiceResult<()> {
        self.cancel.cancel();
        match self.runner.await {
            Ok(Err(e)) => warn!("Runner ended with an error during dismiss: {}", e),
            Err(e) => warn!("Runner task failed during dismiss: {}", e),
            Ok(Ok(_)) => {}
        }
        self.queue.lock().await.dismiss().await?;
        self.active.remove(&self.active_key);
        Ok(())
    }

    /// Wait for the runner to finish
    pub async fn wait(self) -> ServiceResult<RunOutcome> {
        let joined = self.runner.await;
        self.active.remove(&self.active_key);
        let outcome = joined.map_err(|e| ServiceError::Runner(e.to_string()))??;
        Ok(outcome)
    }
}

pub struct UploadService {
    registry: StoreRegistry,
    remote: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    timings: Timings,
    paths: PathTemplates,
    active: ActiveQueues,
}

impl UploadService {
    pub fn new(
        registry: StoreRegistry,
        remote: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        timings: Timings,
        paths: PathTemplates,
    ) -> Self {
        Self {
            registry,
            remote,
            clock,
            timings,
            paths,
            active: Arc::new(DashMap::new()),
        }
    }

    /// SQLite stores under `store_dir`, SFTP remote, system clock
    pub fn from_config(config: &UploadConfig) -> ServiceResult<Self> {
        let remote = SftpBlobStore::from_config(&config.sftp, &config.credentials_path()?)?;
        Ok(Self::new(
            StoreRegistry::new(&config.store_dir),
            Arc::new(remote),
            Arc::new(SystemClock),
            config.timings,
            config.paths.clone(),
        ))
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    fn deps(&self, store: Arc<dyn KvStore>) -> (QueueDeps, mpsc::UnboundedReceiver<QueueEvent>) {
        let (sink, rx) = events::channel();
        let deps = QueueDeps {
            store,
            remote: Arc::clone(&self.remote),
            clock: Arc::clone(&self.clock),
            events: sink,
            lease_ttl_ms: self.timings.lease_ttl_ms,
        };
        (deps, rx)
    }

    fn launch(
        &self,
        store_id: &str,
        queue: Queue,
        events: mpsc::UnboundedReceiver<QueueEvent>,
    ) -> ServiceResult<RecordingSession> {
        let active_key = format!("{}/{}", store_id, queue.record().queue_key);
        let cancel = CancellationToken::new();
        match self.active.entry(active_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ServiceError::AlreadyRunning {
                    draft_id: queue.record().draft_id.clone(),
                    kind: queue.kind(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let queue = Arc::new(Mutex::new(queue));
        let runner = QueueRunner::new(Arc::clone(&queue), self.timings, cancel.clone()).spawn();
        Ok(RecordingSession {
            queue,
            events: Some(events),
            cancel,
            runner,
            active: Arc::clone(&self.active),
            active_key,
        })
    }

    /// Create a live queue for one track of a draft and start driving it
    ///
    /// Leftovers of an earlier recording under the same key are flushed first,
    /// unless another instance still holds their lease.
    pub async fn start_recording(
        &self,
        store_id: &str,
        draft_id: &str,
        kind: QueueKind,
    ) -> ServiceResult<RecordingSession> {
        let active_key = format!("{}/{}", store_id, queue_key(draft_id, kind));
        if self.active.contains_key(&active_key) {
            return Err(ServiceError::AlreadyRunning {
                draft_id: draft_id.to_string(),
                kind,
            });
        }

        let store = self.registry.open(store_id).await?;
        let key = queue_key(draft_id, kind);
        if let Some(raw) = store.get(&key).await? {
            let previous = QueueRecord::decode(&key, &raw)?;
            if self.lease_is_live(store.as_ref(), &previous.lock_key).await? {
                return Err(ServiceError::AlreadyRunning {
                    draft_id: draft_id.to_string(),
                    kind,
                });
            }
            warn!("Replacing leftover queue {} ({})", key, previous.status);
            flush_queue_record(store.as_ref(), &previous).await?;
        }

        let (deps, rx) = self.deps(store);
        let mut queue = Queue::create(
            draft_id,
            kind,
            &self.paths.upload_path(draft_id, kind),
            &self.paths.stitch_path(draft_id, kind),
            deps,
        );
        queue.start().await?;
        self.launch(store_id, queue, rx)
    }

    async fn lease_is_live(&self, store: &dyn KvStore, lock_key: &str) -> ServiceResult<bool> {
        let Some(raw) = store.get(lock_key).await? else {
            return Ok(false);
        };
        Ok(decode_timestamp(lock_key, &raw)
            .map(|ts| !is_stale(ts, self.clock.now_ms(), self.timings.lease_ttl_ms))
            .unwrap_or(false))
    }

    fn scanner(&self, store: Arc<dyn KvStore>) -> RecoveryScanner {
        RecoveryScanner::new(store, Arc::clone(&self.clock), self.timings.lease_ttl_ms)
    }

    fn reattach(
        &self,
        store_id: &str,
        store: &Arc<dyn KvStore>,
        report: RecoveryReport,
    ) -> ServiceResult<Vec<RecordingSession>> {
        let mut sessions = Vec::with_capacity(report.reattached.len());
        for record in report.reattached {
            let active_key = format!("{}/{}", store_id, record.queue_key);
            if self.active.contains_key(&active_key) {
                continue;
            }
            let (deps, rx) = self.deps(Arc::clone(store));
            sessions.push(self.launch(store_id, Queue::from_record(record, deps), rx)?);
        }
        Ok(sessions)
    }

    /// Recovery scan of one draft; reattached queues are driven in the background
    pub async fn recover(
        &self,
        store_id: &str,
        draft_id: &str,
    ) -> ServiceResult<Vec<RecordingSession>> {
        let store = self.registry.open(store_id).await?;
        let report = self.scanner(Arc::clone(&store)).scan(draft_id).await?;
        info!(
            "Recovery of draft {}: {} reattached, {} flushed",
            draft_id,
            report.reattached.len(),
            report.flushed.len()
        );
        self.reattach(store_id, &store, report)
    }

    /// Recovery scan of every draft in a store
    pub async fn recover_all(&self, store_id: &str) -> ServiceResult<Vec<RecordingSession>> {
        let store = self.registry.open(store_id).await?;
        let report = self.scanner(Arc::clone(&store)).scan_all().await?;
        info!(
            "Recovery of store {}: {} reattached, {} flushed",
            store_id,
            report.reattached.len(),
            report.flushed.len()
        );
        self.reattach(store_id, &store, report)
    }

    /// Ask whichever instance drives the queue to delete it
    pub async fn request_flush(
        &self,
        store_id: &str,
        draft_id: &str,
        kind: QueueKind,
    ) -> ServiceResult<()> {
        let store = self.registry.open(store_id).await?;
        let key = flush_key(draft_id, kind);
        let marker = FlushMarker { seen: false }.encode(&key)?;
        store.put(&key, &marker, None).await?;
        info!("Flush requested for draft {} ({})", draft_id, kind);
        Ok(())
    }

    /// Every persisted queue record in a store, in key order
    pub async fn list_queues(&self, store_id: &str) -> ServiceResult<Vec<QueueRecord>> {
        let store = self.registry.open(store_id).await?;
        let mut records = Vec::new();
        for (key, raw) in store.query_by_index(QUEUE_OBJECT_TYPE).await? {
            match QueueRecord::decode(&key, &raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable queue record: {}", e),
            }
        }
        Ok(records)
    }
}
