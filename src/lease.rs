//! Per-queue mutual exclusion through a timestamp stored in the shared store.
//!
//! The holder rewrites the timestamp every renew interval. Any instance may
//! take the lease over once the timestamp is older than the TTL. All writes
//! are compare-and-swap, so two instances racing for a stale lease cannot
//! both win.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::store::KvStore;

/// Marks `ours` while we do not hold the lease
const NOT_HELD: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease existed and we created it
    Acquired,
    /// The previous holder went stale and we replaced its timestamp
    TakenOver { previous: i64 },
    /// We already hold it
    HeldByUs,
    /// Another instance holds a fresh lease
    HeldElsewhere { timestamp: i64 },
}

impl LeaseDecision {
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            LeaseDecision::Acquired | LeaseDecision::TakenOver { .. } | LeaseDecision::HeldByUs
        )
    }
}

/// Handle on one lease record
///
/// Clones share the held timestamp, so a renewal task can keep the lease
/// fresh while the queue owning the original handle is busy.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KvStore>,
    key: String,
    clock: Arc<dyn Clock>,
    ttl_ms: i64,
    /// Timestamp we last wrote, while we believe we hold the lease
    ours: Arc<AtomicI64>,
    /// Acquire, renew and release run one at a time across clones
    gate: Arc<Mutex<()>>,
}

pub fn encode_timestamp(ts: i64) -> Vec<u8> {
    ts.to_string().into_bytes()
}

pub fn decode_timestamp(key: &str, raw: &[u8]) -> StoreResult<i64> {
    serde_json::from_slice(raw).map_err(|source| StoreError::Decode {
        key: key.to_string(),
        source,
    })
}

/// Whether a lease written at `timestamp` is abandoned at `now`
pub fn is_stale(timestamp: i64, now: i64, ttl_ms: i64) -> bool {
    now.saturating_sub(timestamp) > ttl_ms
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KvStore>, key: &str, clock: Arc<dyn Clock>, ttl_ms: i64) -> Self {
        Self {
            store,
            key: key.to_string(),
            clock,
            ttl_ms,
            ours: Arc::new(AtomicI64::new(NOT_HELD)),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held_at().is_some()
    }

    fn held_at(&self) -> Option<i64> {
        match self.ours.load(Ordering::SeqCst) {
            NOT_HELD => None,
            ts => Some(ts),
        }
    }

    fn set_held(&self, ts: Option<i64>) {
        self.ours.store(ts.unwrap_or(NOT_HELD), Ordering::SeqCst);
    }

    pub async fn try_acquire(&self) -> StoreResult<LeaseDecision> {
        let _gate = self.gate.lock().await;
        let now = self.clock.now_ms();
        let fresh = encode_timestamp(now);

        let current = match self.store.get(&self.key).await? {
            None => {
                if self
                    .store
                    .compare_and_swap(&self.key, None, Some(&fresh))
                    .await?
                {
                    self.set_held(Some(now));
                    info!("Acquired lease {}", self.key);
                    return Ok(LeaseDecision::Acquired);
                }
                // Lost the race to create it; report whoever won
                match self.store.get(&self.key).await? {
                    Some(raw) => raw,
                    None => return Ok(LeaseDecision::HeldElsewhere { timestamp: now }),
                }
            }
            Some(raw) => raw,
        };

        let timestamp = match decode_timestamp(&self.key, &current) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Unreadable lease {}, treating as stale: {}", self.key, e);
                NOT_HELD
            }
        };

        if timestamp != NOT_HELD && self.held_at() == Some(timestamp) {
            return Ok(LeaseDecision::HeldByUs);
        }

        if !is_stale(timestamp, now, self.ttl_ms) {
            if self.is_held() {
                warn!("Lease {} was replaced by another instance", self.key);
                self.set_held(None);
            }
            return Ok(LeaseDecision::HeldElsewhere { timestamp });
        }

        if self
            .store
            .compare_and_swap(&self.key, Some(&current), Some(&fresh))
            .await?
        {
            info!(
                "Took over stale lease {} (last renewed {} ms ago)",
                self.key,
                now.saturating_sub(timestamp)
            );
            self.set_held(Some(now));
            Ok(LeaseDecision::TakenOver {
                previous: timestamp,
            })
        } else {
            debug!("Lost takeover race for {}", self.key);
            self.set_held(None);
            Ok(LeaseDecision::HeldElsewhere { timestamp: now })
        }
    }

    /// Refresh our timestamp; `false` once someone else has replaced it
    pub async fn renew(&self) -> StoreResult<bool> {
        let _gate = self.gate.lock().await;
        let Some(previous) = self.held_at() else {
            return Ok(false);
        };
        let now = self.clock.now_ms();
        let renewed = self
            .store
            .compare_and_swap(
                &self.key,
                Some(&encode_timestamp(previous)),
                Some(&encode_timestamp(now)),
            )
            .await?;

        if renewed {
            debug!("Lease {} renewed", self.key);
            self.set_held(Some(now));
        } else {
            warn!("Failed to renew lease {} - lost ownership", self.key);
            self.set_held(None);
        }
        Ok(renewed)
    }

    /// Delete the lease if we still hold it; idempotent
    pub async fn release(&self) -> StoreResult<()> {
        let _gate = self.gate.lock().await;
        if let Some(ts) = self.held_at() {
            self.set_held(None);
            if self
                .store
                .compare_and_swap(&self.key, Some(&encode_timestamp(ts)), None)
                .await?
            {
                info!("Released lease {}", self.key);
            }
        }
        Ok(())
    }

    /// Drop our claim without touching the store (the record was deleted elsewhere)
    pub fn forget(&self) {
        self.set_held(None);
    }
}
