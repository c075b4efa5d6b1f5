//! Entry points used by the HTTP layer for everything that touches a live
//! auction: placing bids, toggling availability and removing resources or
//! bids. Each streaming operation hands back an [`EventStream`] fed by a
//! detached task; dropping the stream ends that task and nothing else.

use cloudbid_ledger::{CreditLedger, MarketStore};
use cloudbid_types::{Bid, BidId, BidRequest, ResourceId, UserId};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::coordinator::{AuctionCoordinator, AuctionTimings, REASON_UNSETTLED};
use crate::error::AuctionError;
use crate::events::{event_channel, EventSink, EventStream, ResourceEvent, StreamFrame};
use crate::registry::{AuctionRegistry, BidOutcome};

/// Result of toggling a resource's availability.
#[derive(Debug)]
pub enum Availability {
    /// The resource is now up for auction; the stream reports how the
    /// window ends for its owner.
    Opened(EventStream),
    /// The resource was withdrawn and its auction closed.
    Closed,
}

#[derive(Clone)]
pub struct AuctionService {
    ledger: CreditLedger,
    registry: Arc<AuctionRegistry>,
    coordinator: AuctionCoordinator,
}

impl AuctionService {
    pub fn new(ledger: CreditLedger, timings: AuctionTimings) -> Self {
        let registry = Arc::new(AuctionRegistry::new());
        let coordinator = AuctionCoordinator::new(ledger.clone(), registry.clone(), timings);
        Self {
            ledger,
            registry,
            coordinator,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        self.ledger.store()
    }

    pub fn registry(&self) -> &AuctionRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &AuctionCoordinator {
        &self.coordinator
    }

    /// Admits the bid against the renter's escrow and installs it as the
    /// leader of its resource. The stream reports the outcome to the bidder.
    ///
    /// Placement never opens a window: a bid whose resource was withdrawn
    /// between admission and placement is rejected at once, in the store as
    /// well as on its stream.
    pub async fn place_bid(
        &self,
        renter: UserId,
        request: &BidRequest,
    ) -> Result<(Bid, EventStream), AuctionError> {
        if self.coordinator.is_shutting_down() {
            return Err(AuctionError::ShuttingDown);
        }
        let bid = self.ledger.admit(renter, request).await?;

        let placement = self.registry.place_leader(bid.clone());
        if let Some(lost) = placement.superseded {
            self.reject_in_store(&lost).await;
        }

        let (sink, stream) = event_channel();
        tokio::spawn(feed_bidder(sink, bid.bid, placement.outcome));
        Ok((bid, stream))
    }

    /// Flips availability of an owned resource. Making it available opens an
    /// auction window and returns the owner's stream for it; withdrawing it
    /// rejects every pending bid and releases the leader.
    pub async fn toggle_availability(
        &self,
        uid: UserId,
        rid: ResourceId,
    ) -> Result<Availability, AuctionError> {
        self.ensure_resource_owner(uid, rid).await?;
        let available = self.store().flip_availability(rid).await?;
        info!(rid = %rid, uid = %uid, available, "resource availability toggled");

        if !available {
            self.coordinator.revoke(rid).await?;
            return Ok(Availability::Closed);
        }

        self.registry.open(rid, uid);
        let events = self.registry.subscribe(rid);
        self.coordinator.ensure_open(rid, uid)?;

        let (sink, stream) = event_channel();
        match events {
            Some(events) => {
                tokio::spawn(feed_loaner(sink, rid, events));
            }
            None => warn!(rid = %rid, "no event channel for freshly opened resource"),
        }
        Ok(Availability::Opened(stream))
    }

    /// Deletes an owned, unavailable resource and retires its coordinator.
    pub async fn delete_resource(&self, uid: UserId, rid: ResourceId) -> Result<(), AuctionError> {
        self.ensure_resource_owner(uid, rid).await?;
        self.store().delete_resource(rid).await?;
        self.coordinator.retire(rid);
        info!(rid = %rid, uid = %uid, "resource deleted");
        Ok(())
    }

    /// Deletes one of the caller's bids. A leading bid is withdrawn from its
    /// auction first-hand; its bidder stream sees the rejection.
    pub async fn delete_bid(&self, uid: UserId, bid: BidId) -> Result<Bid, AuctionError> {
        if self.store().bid_owner(bid).await? != uid {
            return Err(AuctionError::NotBidOwner { uid, bid });
        }
        let removed = self.store().delete_bid(bid).await?;
        if self.registry.withdraw(removed.rid, removed.bid) {
            debug!(rid = %removed.rid, bid = %bid, "leading bid withdrawn");
        }
        Ok(removed)
    }

    pub async fn bootstrap(&self) -> Result<usize, AuctionError> {
        self.coordinator.bootstrap().await
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await
    }

    async fn ensure_resource_owner(&self, uid: UserId, rid: ResourceId) -> Result<(), AuctionError> {
        if self.store().owner_of(rid).await? != uid {
            return Err(AuctionError::NotResourceOwner { uid, rid });
        }
        Ok(())
    }

    async fn reject_in_store(&self, bid: &Bid) {
        match self.store().mark_bid_rejected(bid.bid).await {
            Ok(changed) => {
                debug!(rid = %bid.rid, bid = %bid.bid, changed, "superseded bid rejected")
            }
            Err(err) => warn!(rid = %bid.rid, bid = %bid.bid, error = %err, "failed to reject superseded bid"),
        }
    }
}

async fn feed_bidder(sink: EventSink, bid: BidId, outcome: oneshot::Receiver<BidOutcome>) {
    let outcome = tokio::select! {
        _ = sink.closed() => {
            debug!(bid = %bid, "bidder left before the outcome");
            return;
        }
        outcome = outcome => outcome,
    };

    let ended = match outcome {
        Ok(BidOutcome::Rejected { reason }) => {
            let _ = sink.send(StreamFrame::rejected(reason)).await;
            return;
        }
        Ok(BidOutcome::Failed { reason }) => {
            let _ = sink.send(StreamFrame::error_occurred(reason)).await;
            return;
        }
        Err(_) => {
            let _ = sink.send(StreamFrame::error_occurred("auction closed")).await;
            return;
        }
        Ok(BidOutcome::Accepted { ended }) => ended,
    };

    if sink.send(StreamFrame::starting_connection()).await.is_err() {
        debug!(bid = %bid, "bidder left before the connection started");
        return;
    }
    tokio::select! {
        _ = sink.closed() => debug!(bid = %bid, "bidder left during compute"),
        result = ended => {
            let frame = match result {
                Ok(()) => StreamFrame::connection_ended(),
                Err(_) => StreamFrame::error_occurred(REASON_UNSETTLED),
            };
            let _ = sink.send(frame).await;
        }
    }
}

async fn feed_loaner(
    sink: EventSink,
    rid: ResourceId,
    mut events: broadcast::Receiver<ResourceEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = sink.closed() => break,
            event = events.recv() => event,
        };
        let frame = match event {
            Ok(ResourceEvent::NoBids) => {
                let _ = sink.send(StreamFrame::no_bids()).await;
                break;
            }
            Ok(ResourceEvent::ConnectionStarted { .. }) => StreamFrame::starting_connection(),
            Ok(ResourceEvent::ConnectionEnded { .. }) => {
                let _ = sink.send(StreamFrame::connection_ended()).await;
                break;
            }
            Ok(ResourceEvent::Failed { reason }) => {
                let _ = sink.send(StreamFrame::error_occurred(reason)).await;
                break;
            }
            Ok(ResourceEvent::Revoked) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(rid = %rid, missed, "loaner stream lagged");
                continue;
            }
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    debug!(rid = %rid, "loaner stream finished");
}
