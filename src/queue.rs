//! Per-recording upload queue.
//!
//! A queue owns the ordered list of locally persisted chunks of one track,
//! uploads them one at a time, asks the remote to stitch them once the
//! recording has stopped, and writes its record through to the store after
//! every mutation so any instance can pick it up after a crash.

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::clock::Clock;
use crate::constants::{
    CHUNK_EXTENSION, MAX_CONCAT_ERRORS, MAX_ELEMENT_FETCH_ERRORS, QUEUE_OBJECT_TYPE,
};
use crate::error::{ErrorKind, QueueError, RemoteError, RemoteResult, StoreResult};
use crate::events::{EventSink, QueueEvent, QueueProgress};
use crate::lease::LeaseLock;
use crate::record::{blob_key, FlushMarker, QueueKind, QueueRecord};
use crate::remote::{retry_after_refresh, BlobStore, ConcatOutput, RemoteObject};
use crate::status::{ActivityStatus, QueueStatus};
use crate::store::KvStore;

/// Collaborators shared by every queue of a service
#[derive(Clone)]
pub struct QueueDeps {
    pub store: Arc<dyn KvStore>,
    pub remote: Arc<dyn BlobStore>,
    pub clock: Arc<dyn Clock>,
    pub events: EventSink,
    pub lease_ttl_ms: i64,
}

/// What a single processing step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do yet
    Idle,
    Uploaded { remote_path: String },
    /// Recoverable failure; the same work is attempted on the next tick
    Retry(ErrorKind),
    /// Moved to a new non-terminal state
    Advanced(QueueStatus),
    Completed(RemoteObject),
    Finished(QueueStatus),
}

impl TickOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, TickOutcome::Completed(_) | TickOutcome::Finished(_))
    }
}

/// Result of the local half of a tick
#[derive(Debug)]
pub enum TickStep {
    Done(TickOutcome),
    /// Remote work to run before [`Queue::finish_tick`]
    Remote(RemoteCall),
}

/// Remote work handed out by a tick
#[derive(Debug, Clone)]
pub enum RemoteCall {
    Upload {
        key: String,
        remote_path: String,
        payload: Bytes,
    },
    /// Concatenate `keys` into `path`, then sign it
    Stitch {
        path: String,
        keys: Vec<String>,
        content_type: String,
    },
    /// Sign an object stitched by an earlier attempt
    Sign { path: String },
}

#[derive(Debug)]
pub enum RemoteReply {
    Uploaded {
        key: String,
        size: u64,
        result: RemoteResult<String>,
    },
    Stitched {
        target: String,
        /// `None` when the object was stitched earlier
        concat: Option<RemoteResult<ConcatOutput>>,
        /// `None` when the concat failed
        signed: Option<RemoteResult<String>>,
    },
}

impl RemoteCall {
    pub async fn run(self, remote: &dyn BlobStore) -> RemoteReply {
        match self {
            RemoteCall::Upload {
                key,
                remote_path,
                payload,
            } => {
                let size = payload.len() as u64;
                let result = retry_after_refresh(remote, || {
                    remote.upload(&remote_path, payload.clone())
                })
                .await;
                RemoteReply::Uploaded { key, size, result }
            }
            RemoteCall::Stitch {
                path,
                keys,
                content_type,
            } => {
                let concat =
                    retry_after_refresh(remote, || remote.concat(&path, &keys, &content_type))
                        .await;
                let Some(target) = concat.as_ref().ok().map(|o| o.result_path.clone()) else {
                    return RemoteReply::Stitched {
                        target: path,
                        concat: Some(concat),
                        signed: None,
                    };
                };
                let signed = retry_after_refresh(remote, || remote.sign(&target)).await;
                RemoteReply::Stitched {
                    target,
                    concat: Some(concat),
                    signed: Some(signed),
                }
            }
            RemoteCall::Sign { path } => {
                let signed = retry_after_refresh(remote, || remote.sign(&path)).await;
                RemoteReply::Stitched {
                    target: path,
                    concat: None,
                    signed: Some(signed),
                }
            }
        }
    }
}

pub struct Queue {
    record: QueueRecord,
    store: Arc<dyn KvStore>,
    remote: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    lease: LeaseLock,
    upload_status: ActivityStatus,
    recording_status: ActivityStatus,
    last_blob_stamp: i64,
}

/// Delete a queue's pending chunks, its lease and its record
///
/// Not atomic; every step is a plain delete, so re-running it finishes a
/// partially flushed queue.
pub async fn flush_queue_record(store: &dyn KvStore, record: &QueueRecord) -> StoreResult<()> {
    for key in &record.record_queue {
        store.delete(key).await?;
    }
    store.delete(&record.lock_key).await?;
    store.delete(&record.queue_key).await?;
    Ok(())
}

fn remote_join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn stamp_of(key: &str) -> Option<i64> {
    key.rsplit('_').next().and_then(|s| s.parse().ok())
}

impl Queue {
    pub fn create(
        draft_id: &str,
        kind: QueueKind,
        upload_path: &str,
        stitch_path: &str,
        deps: QueueDeps,
    ) -> Self {
        Self::from_record(
            QueueRecord::new(draft_id, kind, upload_path, stitch_path),
            deps,
        )
    }

    /// Rehydrate a queue from a persisted record
    pub fn from_record(record: QueueRecord, deps: QueueDeps) -> Self {
        let lease = LeaseLock::new(
            Arc::clone(&deps.store),
            &record.lock_key,
            Arc::clone(&deps.clock),
            deps.lease_ttl_ms,
        );
        let last_blob_stamp = record
            .record_queue
            .back()
            .and_then(|k| stamp_of(k))
            .unwrap_or(0);
        Self {
            record,
            store: deps.store,
            remote: deps.remote,
            clock: deps.clock,
            events: deps.events,
            lease,
            upload_status: ActivityStatus::Inactive,
            recording_status: ActivityStatus::Inactive,
            last_blob_stamp,
        }
    }

    pub fn record(&self) -> &QueueRecord {
        &self.record
    }

    pub fn kind(&self) -> QueueKind {
        self.record.kind
    }

    pub fn status(&self) -> QueueStatus {
        self.record.status
    }

    pub fn recording_status(&self) -> ActivityStatus {
        self.recording_status
    }

    pub fn upload_status(&self) -> ActivityStatus {
        self.upload_status
    }

    pub fn lease(&self) -> &LeaseLock {
        &self.lease
    }

    pub fn remote(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.remote)
    }

    pub fn progress(&self) -> QueueProgress {
        QueueProgress {
            kind: self.record.kind,
            status: self.record.status,
            uploaded_bytes: self.record.uploaded_size,
            total_bytes: self.record.total_size,
        }
    }

    /// Begin a live recording
    pub async fn start(&mut self) -> Result<(), QueueError> {
        self.record.start_time = self.clock.now_ms();
        self.record.status = QueueStatus::Pending;
        self.record.live_queue = true;
        self.record.was_stopped = false;
        self.recording_status = ActivityStatus::Active;
        self.persist().await?;
        info!("Queue {} started", self.record.queue_key);
        Ok(())
    }

    /// Persist one captured chunk and append it to the queue
    ///
    /// Returns the chunk key, or `None` when the recording was cancelled and
    /// the chunk discarded.
    pub async fn handle_chunk(&mut self, payload: Bytes) -> Result<Option<String>, QueueError> {
        if self.recording_status == ActivityStatus::Cancelled {
            debug!("Discarding chunk for dismissed queue {}", self.record.queue_key);
            return Ok(None);
        }
        if payload.is_empty() {
            self.report(ErrorKind::StaleCapture, true);
            return Err(QueueError::StaleCapture);
        }
        if self.record.status != QueueStatus::Pending {
            return Err(QueueError::NotAccepting {
                kind: self.record.kind,
                status: self.record.status,
            });
        }

        // Strictly increasing so two chunks in the same millisecond get distinct keys
        let stamp = self.clock.now_ms().max(self.last_blob_stamp + 1);
        self.last_blob_stamp = stamp;
        let key = blob_key(&self.record.draft_id, self.record.kind, stamp);
        let size = payload.len() as u64;

        self.store.put(&key, &payload, None).await?;
        self.record.record_queue.push_back(key.clone());
        self.record.chunk_sizes.push(size);
        self.record.total_size += size;
        self.persist().await?;

        debug!("Queued {} ({} bytes)", key, size);
        Ok(Some(key))
    }

    /// The capture source has finished; drain and stitch what is left
    pub async fn mark_stopped(&mut self) -> Result<(), QueueError> {
        self.record.live_queue = false;
        self.record.was_stopped = true;
        self.record.end_time = self.clock.now_ms();
        if self.recording_status == ActivityStatus::Active {
            self.recording_status = ActivityStatus::Inactive;
        }
        self.persist().await?;
        info!(
            "Queue {} stopped with {} chunk(s) pending",
            self.record.queue_key,
            self.record.record_queue.len()
        );
        Ok(())
    }

    /// Abandon the recording and delete everything it left behind
    pub async fn dismiss(&mut self) -> Result<(), QueueError> {
        self.recording_status = ActivityStatus::Cancelled;
        self.upload_status = ActivityStatus::Cancelled;
        self.record.live_queue = false;
        self.record.end_time = self.clock.now_ms();
        self.lease.release().await?;
        self.flush_everything().await?;
        self.report(ErrorKind::Dismissed, true);
        Ok(())
    }

    /// Replace the in-memory record with the persisted one; `false` if it is gone
    pub async fn reload(&mut self) -> Result<bool, QueueError> {
        match self.store.get(&self.record.queue_key).await? {
            Some(raw) => {
                self.record = QueueRecord::decode(&self.record.queue_key, &raw)?;
                if let Some(stamp) = self.record.record_queue.back().and_then(|k| stamp_of(k)) {
                    self.last_blob_stamp = self.last_blob_stamp.max(stamp);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Prepare to process after obtaining the lease
    ///
    /// A record deleted in the meantime turns into a flush on the next tick.
    pub async fn resume(&mut self) -> Result<(), QueueError> {
        if !self.reload().await? {
            warn!(
                "Queue {} vanished from the store, flushing",
                self.record.queue_key
            );
            self.record.status = QueueStatus::Delete;
        }
        Ok(())
    }

    pub async fn release_lease(&mut self) -> Result<(), QueueError> {
        self.lease.release().await?;
        Ok(())
    }

    /// One processing step
    pub async fn tick(&mut self) -> Result<TickOutcome, QueueError> {
        match self.begin_tick().await? {
            TickStep::Done(outcome) => Ok(outcome),
            TickStep::Remote(call) => {
                let remote = self.remote();
                let reply = call.run(remote.as_ref()).await;
                self.finish_tick(reply).await
            }
        }
    }

    /// Local half of a tick, up to the remote call it needs, if any
    ///
    /// The call can run without access to the queue; its reply goes back
    /// through [`Queue::finish_tick`].
    pub async fn begin_tick(&mut self) -> Result<TickStep, QueueError> {
        let state = if self.consume_flush_marker().await? {
            QueueStatus::Delete
        } else {
            self.record.status
        };

        match state {
            QueueStatus::Pending => self.begin_pending().await,
            QueueStatus::Stitching => {
                if self.record.stitching_in_progress {
                    return Ok(TickStep::Done(TickOutcome::Idle));
                }
                self.begin_stitching().await
            }
            QueueStatus::Done | QueueStatus::NoData | QueueStatus::Error => {
                self.lease.release().await?;
                Ok(TickStep::Done(TickOutcome::Finished(state)))
            }
            QueueStatus::Delete => {
                self.lease.release().await?;
                self.flush_everything().await?;
                Ok(TickStep::Done(TickOutcome::Finished(QueueStatus::Delete)))
            }
        }
    }

    /// Apply the reply of a call handed out by [`Queue::begin_tick`]
    pub async fn finish_tick(&mut self, reply: RemoteReply) -> Result<TickOutcome, QueueError> {
        match reply {
            RemoteReply::Uploaded { key, size, result } => {
                if self.upload_status == ActivityStatus::Active {
                    self.upload_status = ActivityStatus::Inactive;
                }
                self.finish_upload(key, size, result).await
            }
            RemoteReply::Stitched {
                target,
                concat,
                signed,
            } => {
                self.record.stitching_in_progress = false;
                self.finish_stitching(target, concat, signed).await
            }
        }
    }

    /// Swap an unseen flush marker to seen; only one observer can win
    async fn consume_flush_marker(&self) -> Result<bool, QueueError> {
        let key = &self.record.flush_key;
        let Some(raw) = self.store.get(key).await? else {
            return Ok(false);
        };
        let marker = match FlushMarker::decode(key, &raw) {
            Ok(marker) => marker,
            Err(e) => {
                warn!("Ignoring unreadable flush marker: {}", e);
                return Ok(false);
            }
        };
        if marker.seen {
            return Ok(false);
        }

        let seen = FlushMarker { seen: true }.encode(key)?;
        let won = self.store.compare_and_swap(key, Some(&raw), Some(&seen)).await?;
        if won {
            info!("Flush requested for {}", self.record.queue_key);
        }
        Ok(won)
    }

    fn may_upload(&self) -> bool {
        if self.upload_status != ActivityStatus::Inactive {
            return false;
        }
        match self.recording_status {
            ActivityStatus::Active => self.record.live_queue,
            ActivityStatus::Inactive => true,
            ActivityStatus::Cancelled => false,
        }
    }

    async fn begin_pending(&mut self) -> Result<TickStep, QueueError> {
        if !self.may_upload() {
            return Ok(TickStep::Done(TickOutcome::Idle));
        }

        let Some(key) = self.record.record_queue.front().cloned() else {
            if self.record.live_queue {
                return Ok(TickStep::Done(TickOutcome::Idle));
            }
            self.record.status = QueueStatus::Stitching;
            self.persist().await?;
            self.emit_progress();
            info!("Queue {} drained, stitching", self.record.queue_key);
            return Ok(TickStep::Done(TickOutcome::Advanced(QueueStatus::Stitching)));
        };

        let payload = match self.store.get(&key).await {
            Ok(Some(bytes)) => Bytes::from(bytes),
            Ok(None) => return self.element_fetch_failed(&key, "missing").await,
            Err(e) => return self.element_fetch_failed(&key, &e.to_string()).await,
        };
        self.record.error_getting_element = 0;

        let name = format!(
            "{}_{}.{}",
            self.clock.now_ms(),
            self.record.chunks_uploaded,
            CHUNK_EXTENSION
        );
        let remote_path = remote_join(&self.record.upload_path, &name);

        self.upload_status = ActivityStatus::Active;
        Ok(TickStep::Remote(RemoteCall::Upload {
            key,
            remote_path,
            payload,
        }))
    }

    async fn finish_upload(
        &mut self,
        key: String,
        size: u64,
        result: RemoteResult<String>,
    ) -> Result<TickOutcome, QueueError> {
        if self.record.status != QueueStatus::Pending
            || self.record.record_queue.front() != Some(&key)
        {
            warn!(
                "Queue {} changed while {} was uploading, discarding the result",
                self.record.queue_key, key
            );
            return Ok(TickOutcome::Idle);
        }

        match result {
            Ok(stored_path) => {
                let size = self
                    .record
                    .chunk_sizes
                    .get(self.record.chunks_uploaded as usize)
                    .copied()
                    .unwrap_or(size);
                self.record.network_down = false;
                self.record.uploaded_size += size;
                self.record.chunks_uploaded += 1;
                self.record.media_keys.push(stored_path.clone());
                self.record.record_queue.pop_front();
                // The record stops referencing the chunk before the chunk goes away
                self.persist().await?;
                self.store.delete(&key).await?;
                self.emit_progress();
                debug!("Uploaded {} to {}", key, stored_path);
                Ok(TickOutcome::Uploaded {
                    remote_path: stored_path,
                })
            }
            Err(e) if e.is_transient() => {
                warn!("Network down while uploading {}: {}", key, e);
                self.record.network_down = true;
                self.persist().await?;
                self.report(ErrorKind::Network, false);
                Ok(TickOutcome::Retry(ErrorKind::Network))
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", key, e);
                self.report(ErrorKind::UploadFailed, false);
                Ok(TickOutcome::Retry(ErrorKind::UploadFailed))
            }
        }
    }

    async fn element_fetch_failed(
        &mut self,
        key: &str,
        reason: &str,
    ) -> Result<TickStep, QueueError> {
        self.record.error_getting_element += 1;
        warn!(
            "Could not read chunk {} ({}), attempt {}",
            key, reason, self.record.error_getting_element
        );
        if self.record.error_getting_element > MAX_ELEMENT_FETCH_ERRORS {
            return Ok(TickStep::Done(
                self.give_up(ErrorKind::MissingChunkGaveUp).await?,
            ));
        }
        self.persist().await?;
        self.report(ErrorKind::MissingChunk, false);
        Ok(TickStep::Done(TickOutcome::Retry(ErrorKind::MissingChunk)))
    }

    async fn begin_stitching(&mut self) -> Result<TickStep, QueueError> {
        if self.record.media_keys.is_empty() {
            info!("Queue {} has no data", self.record.queue_key);
            self.record.status = QueueStatus::NoData;
            self.persist().await?;
            self.lease.release().await?;
            self.emit_progress();
            return Ok(TickStep::Done(TickOutcome::Finished(QueueStatus::NoData)));
        }

        self.emit_progress();
        let call = match self.record.extra_info.concat_url.clone() {
            Some(path) => RemoteCall::Sign { path },
            None => RemoteCall::Stitch {
                path: remote_join(
                    &self.record.stitch_path,
                    &format!("{}.{}", self.clock.now_ms(), CHUNK_EXTENSION),
                ),
                keys: self.record.media_keys.clone(),
                content_type: self.record.content_type.clone(),
            },
        };
        self.record.stitching_in_progress = true;
        Ok(TickStep::Remote(call))
    }

    async fn finish_stitching(
        &mut self,
        target: String,
        concat: Option<RemoteResult<ConcatOutput>>,
        signed: Option<RemoteResult<String>>,
    ) -> Result<TickOutcome, QueueError> {
        if self.record.status != QueueStatus::Stitching {
            warn!(
                "Queue {} left stitching while the remote was busy",
                self.record.queue_key
            );
            return Ok(TickOutcome::Idle);
        }

        if let Some(result) = concat {
            match result {
                Ok(output) => {
                    info!(
                        "Stitched {} chunk(s) into {} (request {})",
                        self.record.media_keys.len(),
                        output.result_path,
                        output.request_id
                    );
                    self.record.network_down = false;
                    self.record.extra_info.concat_url = Some(output.result_path);
                    self.persist().await?;
                }
                Err(e) => return self.stitch_failed(e).await,
            }
        }

        // A sign failure keeps the stitched object; only signing is retried
        let url = match signed {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                warn!("Signing {} failed: {}", target, e);
                return self.stitch_failed(e).await;
            }
            None => return Ok(TickOutcome::Idle),
        };

        self.record.network_down = false;
        self.record.status = QueueStatus::Done;
        self.persist().await?;
        self.lease.release().await?;

        let object = RemoteObject {
            path: target,
            url,
            kind: self.record.kind,
        };
        info!("Queue {} done: {}", self.record.queue_key, object.url);
        self.emit_progress();
        self.events.emit(QueueEvent::Complete(object.clone()));
        Ok(TickOutcome::Completed(object))
    }

    /// Failed concat or sign; transient and retryable failures carry no penalty
    async fn stitch_failed(&mut self, err: RemoteError) -> Result<TickOutcome, QueueError> {
        if err.is_transient() {
            warn!("Network down while stitching: {}", err);
            self.record.network_down = true;
            self.persist().await?;
            self.report(ErrorKind::Network, false);
            return Ok(TickOutcome::Retry(ErrorKind::Network));
        }
        if err.is_retryable() {
            debug!("Stitch will be retried: {}", err);
            return Ok(TickOutcome::Retry(ErrorKind::StitchFailed));
        }

        self.record.error_invoking_concat += 1;
        warn!(
            "Stitch failed ({}), attempt {}",
            err, self.record.error_invoking_concat
        );
        if self.record.error_invoking_concat > MAX_CONCAT_ERRORS {
            return self.give_up(ErrorKind::StitchFailed).await;
        }
        self.persist().await?;
        self.report(ErrorKind::StitchFailed, false);
        Ok(TickOutcome::Retry(ErrorKind::StitchFailed))
    }

    async fn give_up(&mut self, reason: ErrorKind) -> Result<TickOutcome, QueueError> {
        error!("Queue {} giving up: {}", self.record.queue_key, reason);
        self.record.status = QueueStatus::Error;
        self.persist().await?;
        self.lease.release().await?;
        self.report(reason, true);
        self.emit_progress();
        Ok(TickOutcome::Finished(QueueStatus::Error))
    }

    async fn flush_everything(&mut self) -> Result<(), QueueError> {
        // Chunks persisted by another instance are not in our copy
        if let Some(raw) = self.store.get(&self.record.queue_key).await? {
            if let Ok(persisted) = QueueRecord::decode(&self.record.queue_key, &raw) {
                for key in persisted.record_queue {
                    if !self.record.record_queue.contains(&key) {
                        self.record.record_queue.push_back(key);
                    }
                }
            }
        }

        flush_queue_record(self.store.as_ref(), &self.record).await?;
        self.lease.forget();
        self.record.record_queue.clear();
        self.record.live_queue = false;
        self.record.status = QueueStatus::Delete;
        info!("Flushed queue {}", self.record.queue_key);
        Ok(())
    }

    async fn persist(&self) -> Result<(), QueueError> {
        let encoded = self.record.encode()?;
        self.store
            .put(&self.record.queue_key, &encoded, Some(QUEUE_OBJECT_TYPE))
            .await?;
        Ok(())
    }

    fn emit_progress(&self) {
        self.events.emit(QueueEvent::Progress(self.progress()));
    }

    pub(crate) fn report(&self, error: ErrorKind, fatal: bool) {
        self.events.emit(QueueEvent::Error {
            kind: self.record.kind,
            error,
            fatal,
        });
    }
}
