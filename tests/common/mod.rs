#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use resumable_media_upload::clock::ManualClock;
use resumable_media_upload::error::{RemoteError, RemoteResult};
use resumable_media_upload::events::{self, QueueEvent};
use resumable_media_upload::queue::{Queue, QueueDeps, TickOutcome};
use resumable_media_upload::remote::{BlobStore, ConcatOutput};
use resumable_media_upload::store::{KvStore, MemoryKvStore};
use resumable_media_upload::QueueKind;

pub const START_MS: i64 = 1_700_000_000_000;

/// In-memory remote with scripted failures
#[derive(Default)]
pub struct FakeBlobStore {
    objects: Mutex<Vec<(String, Bytes)>>,
    upload_failures: Mutex<VecDeque<RemoteError>>,
    concat_failures: Mutex<VecDeque<RemoteError>>,
    sign_failures: Mutex<VecDeque<RemoteError>>,
    upload_delay: Mutex<Duration>,
    uploads_started: AtomicUsize,
    concat_calls: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FakeBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_upload(&self, err: RemoteError) {
        self.upload_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_concats(&self, times: usize, err: RemoteError) {
        let mut failures = self.concat_failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(err.clone());
        }
    }

    pub fn fail_next_sign(&self, err: RemoteError) {
        self.sign_failures.lock().unwrap().push_back(err);
    }

    /// Make every upload take `delay` before it lands
    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    pub fn uploads_started(&self) -> usize {
        self.uploads_started.load(Ordering::SeqCst)
    }

    /// Paths of every stored object, in write order
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, b)| b.clone())
    }

    pub fn concat_calls(&self) -> usize {
        self.concat_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(&self, path: &str, data: Bytes) -> RemoteResult<String> {
        self.uploads_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.upload_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.upload_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.objects.lock().unwrap().push((path.to_string(), data));
        Ok(path.to_string())
    }

    async fn sign(&self, path: &str) -> RemoteResult<String> {
        if let Some(err) = self.sign_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        match self.object(path) {
            Some(_) => Ok(format!("https://blobs.example.com/{}", path)),
            None => Err(RemoteError::remote(format!("no such object {}", path), false)),
        }
    }

    async fn concat(
        &self,
        path: &str,
        keys: &[String],
        _content_type: &str,
    ) -> RemoteResult<ConcatOutput> {
        self.concat_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.concat_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut stitched = Vec::new();
        for key in keys {
            match self.object(key) {
                Some(bytes) => stitched.extend_from_slice(&bytes),
                None => return Err(RemoteError::remote(format!("missing {}", key), false)),
            }
        }
        self.objects
            .lock()
            .unwrap()
            .push((path.to_string(), Bytes::from(stitched)));
        Ok(ConcatOutput {
            result_path: path.to_string(),
            request_id: "req_fake".to_string(),
        })
    }

    async fn refresh_credentials(&self) -> RemoteResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryKvStore>,
    pub remote: Arc<FakeBlobStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            remote: FakeBlobStore::new(),
            clock: Arc::new(ManualClock::new(START_MS)),
        }
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub fn deps(&self) -> QueueDeps {
        QueueDeps {
            store: self.store.clone(),
            remote: self.remote.clone(),
            clock: self.clock.clone(),
            events: events::EventSink::disabled(),
            lease_ttl_ms: 15_000,
        }
    }

    pub fn deps_with_events(&self) -> (QueueDeps, mpsc::UnboundedReceiver<QueueEvent>) {
        let (sink, rx) = events::channel();
        let mut deps = self.deps();
        deps.events = sink;
        (deps, rx)
    }

    pub fn queue(&self, draft_id: &str, kind: QueueKind) -> Queue {
        Queue::create(
            draft_id,
            kind,
            &format!("uploads/{}/{}", draft_id, kind),
            &format!("stitched/{}/{}", draft_id, kind),
            self.deps(),
        )
    }
}

/// A started queue holding `sizes.len()` chunks of the given sizes
pub async fn queue_with_chunks(h: &Harness, draft_id: &str, kind: QueueKind, sizes: &[usize]) -> Queue {
    let mut queue = h.queue(draft_id, kind);
    queue.start().await.unwrap();
    for (i, size) in sizes.iter().enumerate() {
        queue
            .handle_chunk(Bytes::from(vec![i as u8 + 1; *size]))
            .await
            .unwrap();
    }
    queue
}

/// Tick until the queue reports a final outcome, advancing the clock each step
pub async fn drive(h: &Harness, queue: &mut Queue, max_ticks: usize) -> Vec<TickOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..max_ticks {
        h.clock.advance(1);
        let outcome = queue.tick().await.unwrap();
        let done = outcome.is_finished();
        outcomes.push(outcome);
        if done {
            break;
        }
    }
    outcomes
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
