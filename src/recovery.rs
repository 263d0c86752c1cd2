//! Startup reconciliation of queue records left behind by earlier sessions.
//!
//! Stopped queues that still have work are handed back for processing.
//! Queues whose recording never stopped were abandoned mid-capture and are
//! deleted together with their chunks.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::clock::Clock;
use crate::constants::QUEUE_OBJECT_TYPE;
use crate::error::StoreResult;
use crate::lease::{decode_timestamp, is_stale};
use crate::queue::flush_queue_record;
use crate::record::{queue_key_prefix, QueueRecord};
use crate::store::KvStore;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Stopped, unfinished queues to drive again
    pub reattached: Vec<QueueRecord>,
    /// Queue keys that were deleted
    pub flushed: Vec<String>,
    /// Queue keys left untouched (finished, unreadable, or owned by a live instance)
    pub skipped: Vec<String>,
}

pub struct RecoveryScanner {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    lease_ttl_ms: i64,
}

impl RecoveryScanner {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, lease_ttl_ms: i64) -> Self {
        Self {
            store,
            clock,
            lease_ttl_ms,
        }
    }

    /// Reconcile every queue of one draft
    pub async fn scan(&self, draft_id: &str) -> StoreResult<RecoveryReport> {
        self.scan_matching(Some(&queue_key_prefix(draft_id))).await
    }

    /// Reconcile every queue in the store
    pub async fn scan_all(&self) -> StoreResult<RecoveryReport> {
        self.scan_matching(None).await
    }

    async fn scan_matching(&self, prefix: Option<&str>) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for (key, raw) in self.store.query_by_index(QUEUE_OBJECT_TYPE).await? {
            if let Some(prefix) = prefix {
                if !key.starts_with(prefix) {
                    continue;
                }
            }

            let record = match QueueRecord::decode(&key, &raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable queue record: {}", e);
                    report.skipped.push(key);
                    continue;
                }
            };

            if !record.was_stopped {
                if self.has_live_owner(&record).await? {
                    debug!("Queue {} is still recording in a running instance", key);
                    report.skipped.push(key);
                    continue;
                }
                flush_queue_record(self.store.as_ref(), &record).await?;
                info!(
                    "Flushed abandoned queue {} ({} chunk(s))",
                    key,
                    record.record_queue.len()
                );
                report.flushed.push(key);
            } else if !record.status.is_terminal() {
                info!("Reattaching queue {} in {}", key, record.status);
                report.reattached.push(record);
            } else {
                debug!("Queue {} already finished ({})", key, record.status);
                report.skipped.push(key);
            }
        }

        Ok(report)
    }

    /// A fresh lease means another instance is driving the queue right now
    async fn has_live_owner(&self, record: &QueueRecord) -> StoreResult<bool> {
        let Some(raw) = self.store.get(&record.lock_key).await? else {
            return Ok(false);
        };
        let Ok(timestamp) = decode_timestamp(&record.lock_key, &raw) else {
            return Ok(false);
        };
        Ok(!is_stale(timestamp, self.clock.now_ms(), self.lease_ttl_ms))
    }
}
