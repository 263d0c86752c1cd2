//! Drives one queue: lease check, background lease renewal and processing ticks.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::Timings;
use crate::error::{ErrorKind, QueueError};
use crate::lease::LeaseLock;
use crate::queue::{Queue, TickOutcome, TickStep};
use crate::remote::RemoteObject;
use crate::status::QueueStatus;

/// How a runner ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RemoteObject),
    /// Reached a terminal state without a stitched object
    Finished(QueueStatus),
    Cancelled,
}

pub struct QueueRunner {
    queue: Arc<Mutex<Queue>>,
    timings: Timings,
    cancel: CancellationToken,
}

impl QueueRunner {
    pub fn new(queue: Arc<Mutex<Queue>>, timings: Timings, cancel: CancellationToken) -> Self {
        Self {
            queue,
            timings,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<RunOutcome, QueueError>> {
        tokio::spawn(self.run())
    }

    /// Run until the queue finishes or the token is cancelled
    ///
    /// Processing only happens while this instance holds the queue's lease.
    /// A separate task renews it, so long remote calls do not let it go
    /// stale. Losing the lease pauses processing until it can be taken over
    /// again.
    pub async fn run(self) -> Result<RunOutcome, QueueError> {
        let (queue_key, lease) = {
            let queue = self.queue.lock().await;
            (queue.record().queue_key.clone(), queue.lease().clone())
        };

        // First check fires immediately
        let mut check = interval(self.timings.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Dropping the guard stops the renewal task
        let mut renewal: Option<DropGuard> = None;
        let mut next_tick = Instant::now();

        loop {
            if renewal.is_some() && !lease.is_held() {
                warn!("Lost lease on {} to another instance", queue_key);
                renewal = None;
            }
            let owned = renewal.is_some();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    drop(renewal.take());
                    self.queue.lock().await.release_lease().await?;
                    info!("Runner for {} cancelled", queue_key);
                    return Ok(RunOutcome::Cancelled);
                }

                _ = check.tick() => {
                    match lease.try_acquire().await {
                        Ok(decision) if decision.is_owned() => {
                            if owned {
                                continue;
                            }
                            let mut queue = self.queue.lock().await;
                            if let Err(e) = queue.resume().await {
                                error!("Failed to reload {}: {}", queue_key, e);
                                queue.report(ErrorKind::StoreFailure, false);
                                continue;
                            }
                            debug!("Processing {}", queue_key);
                            renewal = Some(self.spawn_renewal(lease.clone()));
                            next_tick = Instant::now();
                        }
                        Ok(decision) => {
                            debug!("{} is not ours: {:?}", queue_key, decision);
                        }
                        Err(e) => {
                            error!("Lease check for {} failed: {}", queue_key, e);
                            self.queue.lock().await.report(ErrorKind::StoreFailure, false);
                        }
                    }
                }

                _ = sleep_until(next_tick), if owned => {
                    match self.process().await {
                        Ok(TickOutcome::Completed(object)) => return Ok(RunOutcome::Completed(object)),
                        Ok(TickOutcome::Finished(status)) => {
                            info!("{} finished in {}", queue_key, status);
                            return Ok(RunOutcome::Finished(status));
                        }
                        Ok(outcome) => debug!("{} tick: {:?}", queue_key, outcome),
                        Err(e) => {
                            error!("Processing {} failed: {}", queue_key, e);
                            self.queue.lock().await.report(ErrorKind::StoreFailure, false);
                        }
                    }
                    next_tick = Instant::now() + self.timings.next_tick_delay();
                }
            }
        }
    }

    /// One tick; the queue stays unlocked while the remote works so capture
    /// can keep appending chunks
    async fn process(&self) -> Result<TickOutcome, QueueError> {
        let (step, remote) = {
            let mut queue = self.queue.lock().await;
            (queue.begin_tick().await?, queue.remote())
        };
        match step {
            TickStep::Done(outcome) => Ok(outcome),
            TickStep::Remote(call) => {
                let reply = call.run(remote.as_ref()).await;
                self.queue.lock().await.finish_tick(reply).await
            }
        }
    }

    /// Renew `lease` every renew interval until the returned guard is dropped,
    /// the runner is cancelled, or the lease is lost
    fn spawn_renewal(&self, lease: LeaseLock) -> DropGuard {
        let stop = self.cancel.child_token();
        let period = self.timings.renew_interval();
        let token = stop.clone();
        tokio::spawn(async move {
            let mut renew = interval_at(Instant::now() + period, period);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = renew.tick() => match lease.renew().await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => error!("Lease renewal for {} failed: {}", lease.key(), e),
                    },
                }
            }
        });
        stop.drop_guard()
    }
}
