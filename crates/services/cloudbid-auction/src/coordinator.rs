//! One control loop per auctioned resource.
//!
//! A coordinator task moves its resource through Idle, Open (collecting bids
//! until the window timer fires) and Computing (until the compute timer fires
//! and the winner has been charged). Commands from the HTTP side arrive on an
//! unbounded channel and are only looked at while Idle or Open; a resource in
//! compute cannot be toggled, so nothing is lost by deferring them.

use cloudbid_ledger::{AwardOutcome, CreditLedger, StoreError};
use cloudbid_types::{Bid, ResourceId, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::AuctionError;
use crate::events::ResourceEvent;
use crate::registry::{AuctionRegistry, ForceReason};

const SETTLE_ATTEMPTS: u32 = 5;
const SETTLE_BACKOFF: Duration = Duration::from_millis(500);

pub const REASON_UNSETTLED: &str = "compute could not be settled";

/// Timer lengths that drive every coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionTimings {
    /// How long bids are collected before the window closes.
    pub window: Duration,
    /// Wall-clock length of one billed minute of compute.
    pub compute_minute: Duration,
}

impl Default for AuctionTimings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            compute_minute: Duration::from_secs(60),
        }
    }
}

impl AuctionTimings {
    /// Time a winner with a quoted `duration` spends computing.
    pub fn compute_span(&self, duration: i32) -> Duration {
        let minutes = u32::try_from(duration).unwrap_or(0);
        self.compute_minute.saturating_mul(minutes)
    }

    /// Billed minutes after `elapsed`, never more than the quote.
    pub fn elapsed_minutes(&self, elapsed: Duration, duration: i32) -> f64 {
        let quoted = f64::from(duration.max(0));
        if self.compute_minute.is_zero() {
            return quoted;
        }
        (elapsed.as_secs_f64() / self.compute_minute.as_secs_f64()).min(quoted)
    }
}

enum Command {
    /// The owner made the resource available, or a bid arrived for it.
    Opened,
    /// The owner withdrew the resource. `done` fires once pending bids are
    /// rejected and the leader released.
    Revoke { done: oneshot::Sender<()> },
    /// The resource is gone; stop the task.
    Retire,
}

enum Phase {
    Idle,
    Open {
        deadline: Instant,
    },
    Computing {
        winner: Bid,
        started: Instant,
        deadline: Instant,
        ended: oneshot::Sender<()>,
    },
    Stopped,
}

struct TaskHandle {
    epoch: u64,
    commands: mpsc::UnboundedSender<Command>,
}

struct Inner {
    ledger: CreditLedger,
    registry: Arc<AuctionRegistry>,
    timings: AuctionTimings,
    tasks: Mutex<HashMap<ResourceId, TaskHandle>>,
    epochs: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Spawns and addresses the per-resource auction tasks.
#[derive(Clone)]
pub struct AuctionCoordinator {
    inner: Arc<Inner>,
}

impl AuctionCoordinator {
    pub fn new(
        ledger: CreditLedger,
        registry: Arc<AuctionRegistry>,
        timings: AuctionTimings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                registry,
                timings,
                tasks: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn timings(&self) -> AuctionTimings {
        self.inner.timings
    }

    /// Opens the resource's registry slot and makes sure a coordinator is
    /// collecting bids for it. An already running window is not restarted.
    pub fn ensure_open(&self, rid: ResourceId, owner: UserId) -> Result<(), AuctionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(AuctionError::ShuttingDown);
        }
        self.inner.registry.open(rid, owner);

        let mut tasks = self.inner.tasks.lock();
        if let Some(handle) = tasks.get(&rid) {
            if handle.commands.send(Command::Opened).is_ok() {
                return Ok(());
            }
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        tasks.insert(rid, TaskHandle { epoch, commands });
        drop(tasks);

        let inner = self.inner.clone();
        self.inner
            .tracker
            .spawn(async move { inner.run(rid, owner, epoch, rx).await });
        debug!(rid = %rid, owner = %owner, "auction coordinator spawned");
        Ok(())
    }

    /// Closes the auction on `rid`: pending bids are rejected and the leader
    /// is released. Returns once that has happened.
    pub async fn revoke(&self, rid: ResourceId) -> Result<(), AuctionError> {
        let (done, acked) = oneshot::channel();
        let sent = self
            .inner
            .tasks
            .lock()
            .get(&rid)
            .map(|handle| handle.commands.send(Command::Revoke { done }).is_ok())
            .unwrap_or(false);

        if sent && acked.await.is_ok() {
            return Ok(());
        }
        self.inner.revoke_now(rid).await?;
        Ok(())
    }

    /// Stops the coordinator of a deleted resource and drops its slot.
    pub fn retire(&self, rid: ResourceId) {
        if let Some(handle) = self.inner.tasks.lock().remove(&rid) {
            let _ = handle.commands.send(Command::Retire);
        }
        self.inner.registry.remove(rid);
    }

    /// Starts a window for every resource that was left available, so auctions
    /// resume after a restart. Returns how many were opened.
    pub async fn bootstrap(&self) -> Result<usize, AuctionError> {
        let resources = self
            .inner
            .ledger
            .store()
            .list_auctionable_resources()
            .await?;
        for resource in &resources {
            self.ensure_open(resource.rid, resource.owner)?;
        }
        info!(count = resources.len(), "resumed auctions");
        Ok(resources.len())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_running(&self, rid: ResourceId) -> bool {
        self.inner
            .tasks
            .lock()
            .get(&rid)
            .map(|handle| !handle.commands.is_closed())
            .unwrap_or(false)
    }

    /// Cancels every coordinator and waits for them to finish. Open windows
    /// are aborted; running computes are settled first.
    pub async fn shutdown(&self) {
        info!("shutting down auction coordinators");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tasks.lock().clear();
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        rid: ResourceId,
        owner: UserId,
        epoch: u64,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        metrics::gauge!("cloudbid_open_auctions").increment(1.0);
        let mut phase = self.open_window();

        loop {
            phase = match phase {
                Phase::Idle => tokio::select! {
                    _ = self.cancel.cancelled() => Phase::Stopped,
                    command = commands.recv() => self.on_command(rid, command, Phase::Idle).await,
                },
                Phase::Open { deadline } => tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.abort_window(rid).await;
                        Phase::Stopped
                    }
                    _ = sleep_until(deadline) => self.close_window(rid).await,
                    command = commands.recv() => {
                        self.on_command(rid, command, Phase::Open { deadline }).await
                    }
                },
                Phase::Computing {
                    winner,
                    started,
                    deadline,
                    ended,
                } => {
                    let interrupted = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        _ = sleep_until(deadline) => false,
                    };
                    if !self.finish_compute(owner, &winner, started, ended).await {
                        self.registry.publish(
                            rid,
                            ResourceEvent::Failed {
                                reason: REASON_UNSETTLED.to_string(),
                            },
                        );
                        self.registry.remove(rid);
                        Phase::Stopped
                    } else if interrupted {
                        Phase::Stopped
                    } else {
                        self.registry.rearm(rid);
                        self.open_window()
                    }
                }
                Phase::Stopped => break,
            };
        }

        {
            let mut tasks = self.tasks.lock();
            if tasks.get(&rid).map(|h| h.epoch) == Some(epoch) {
                tasks.remove(&rid);
            }
        }
        metrics::gauge!("cloudbid_open_auctions").decrement(1.0);
        debug!(rid = %rid, "auction coordinator stopped");
    }

    fn open_window(&self) -> Phase {
        Phase::Open {
            deadline: Instant::now() + self.timings.window,
        }
    }

    async fn on_command(&self, rid: ResourceId, command: Option<Command>, current: Phase) -> Phase {
        match command {
            Some(Command::Opened) => match current {
                Phase::Idle => {
                    debug!(rid = %rid, "auction window opened");
                    self.open_window()
                }
                other => other,
            },
            Some(Command::Revoke { done }) => {
                if let Err(err) = self.revoke_now(rid).await {
                    error!(rid = %rid, error = %err, "failed to reject pending bids on revocation");
                }
                let _ = done.send(());
                Phase::Idle
            }
            Some(Command::Retire) | None => {
                self.registry.remove(rid);
                Phase::Stopped
            }
        }
    }

    /// Resolves the window in the store, then tells the registry.
    async fn close_window(&self, rid: ResourceId) -> Phase {
        match self.ledger.store().pick_max_bid(rid).await {
            Ok(AwardOutcome::Awarded { winner, rejected }) => {
                let (ended, ended_rx) = oneshot::channel();
                if let Some(displaced) = self.registry.award(rid, &winner, ended_rx) {
                    debug!(rid = %rid, bid = %displaced.bid, "registry leader lost at window close");
                }
                self.registry.publish(
                    rid,
                    ResourceEvent::ConnectionStarted {
                        bid: winner.bid,
                        renter: winner.renter,
                    },
                );
                metrics::counter!("cloudbid_auctions_closed_total", "outcome" => "awarded")
                    .increment(1);
                info!(
                    rid = %rid,
                    bid = %winner.bid,
                    renter = %winner.renter,
                    amount = winner.amount,
                    duration = winner.duration,
                    rejected = rejected.len(),
                    "auction awarded"
                );

                let started = Instant::now();
                let deadline = started + self.timings.compute_span(winner.duration);
                Phase::Computing {
                    winner,
                    started,
                    deadline,
                    ended,
                }
            }
            Ok(AwardOutcome::NoBids) => {
                if let Some(stale) = self.registry.expire(rid) {
                    warn!(rid = %rid, bid = %stale.bid, "registry leader had no pending bid in the store");
                }
                self.registry.publish(rid, ResourceEvent::NoBids);
                metrics::counter!("cloudbid_auctions_closed_total", "outcome" => "no_bids")
                    .increment(1);
                debug!(rid = %rid, "auction window closed without bids");
                self.open_window()
            }
            Ok(AwardOutcome::Withdrawn) => {
                self.registry.force_reject(rid, ForceReason::Revoked);
                self.registry.publish(rid, ResourceEvent::Revoked);
                metrics::counter!("cloudbid_auctions_closed_total", "outcome" => "withdrawn")
                    .increment(1);
                debug!(rid = %rid, "resource withdrawn before window closed");
                Phase::Idle
            }
            Err(err) => {
                metrics::counter!("cloudbid_auctions_closed_total", "outcome" => "error")
                    .increment(1);
                error!(rid = %rid, error = %err, "failed to resolve auction window");
                let reason = "the auction could not be resolved".to_string();
                if let Some(leader) = self.registry.force_reject(rid, ForceReason::Failure(reason)) {
                    if let Err(err) = self.ledger.store().mark_bid_rejected(leader.bid).await {
                        error!(rid = %rid, bid = %leader.bid, error = %err, "failed to reject aborted leader");
                    }
                }
                self.open_window()
            }
        }
    }

    /// Charges the winner, retrying with backoff. Returns false when every
    /// attempt failed; `ended` is then dropped so the bidder sees an error
    /// instead of a clean end, and the resource stays computing in the store.
    async fn finish_compute(
        &self,
        owner: UserId,
        winner: &Bid,
        started: Instant,
        ended: oneshot::Sender<()>,
    ) -> bool {
        let elapsed = self
            .timings
            .elapsed_minutes(started.elapsed(), winner.duration);

        let mut backoff = SETTLE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.ledger.settle(winner, owner, elapsed).await {
                Ok(_) => break,
                Err(err) if attempt < SETTLE_ATTEMPTS => {
                    warn!(rid = %winner.rid, bid = %winner.bid, attempt, error = %err, "settlement failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        rid = %winner.rid,
                        bid = %winner.bid,
                        attempts = attempt,
                        error = %err,
                        "settlement abandoned, resource left computing"
                    );
                    return false;
                }
            }
        }

        self.registry
            .publish(winner.rid, ResourceEvent::ConnectionEnded { bid: winner.bid });
        let _ = ended.send(());
        true
    }

    /// Ends an open window because the service is stopping. The slot goes
    /// first so no bid can take the lead afterwards; every bid that reached
    /// the store by then is rejected there.
    async fn abort_window(&self, rid: ResourceId) {
        if let Some(bid) = self.registry.force_reject(rid, ForceReason::Shutdown) {
            debug!(rid = %rid, bid = %bid.bid, "leader released on shutdown");
        }
        match self.ledger.store().reject_pending_bids(rid).await {
            Ok(rejected) => debug!(rid = %rid, rejected = rejected.len(), "window aborted"),
            Err(err) => error!(rid = %rid, error = %err, "failed to reject pending bids on shutdown"),
        }
    }

    async fn revoke_now(&self, rid: ResourceId) -> Result<(), StoreError> {
        let result = self.ledger.store().reject_pending_bids(rid).await;
        if let Some(leader) = self.registry.force_reject(rid, ForceReason::Revoked) {
            debug!(rid = %rid, bid = %leader.bid, "leader released on revocation");
        }
        self.registry.publish(rid, ResourceEvent::Revoked);
        let rejected = result?;
        info!(rid = %rid, rejected = rejected.len(), "auction revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_span_scales_with_duration() {
        let timings = AuctionTimings {
            window: Duration::from_secs(60),
            compute_minute: Duration::from_secs(60),
        };
        assert_eq!(timings.compute_span(3), Duration::from_secs(180));
        assert_eq!(timings.compute_span(-1), Duration::ZERO);
    }

    #[test]
    fn elapsed_minutes_is_capped_at_quote() {
        let timings = AuctionTimings::default();
        assert_eq!(timings.elapsed_minutes(Duration::from_secs(90), 3), 1.5);
        assert_eq!(timings.elapsed_minutes(Duration::from_secs(600), 3), 3.0);

        let instant = AuctionTimings {
            window: Duration::ZERO,
            compute_minute: Duration::ZERO,
        };
        assert_eq!(instant.elapsed_minutes(Duration::ZERO, 4), 4.0);
    }
}
