//! In-memory auctioneer.
//!
//! One [`AuctionSlot`] per active resource holds the current leading bid and
//! the gate its bidder is waiting on. The map mutex is only held for map
//! operations; nothing awaits while holding it.

use cloudbid_types::{Bid, BidId, ResourceId, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::events::ResourceEvent;

const EVENT_CAPACITY: usize = 16;

pub const REASON_REVOKED: &str = "resource is no longer available";
pub const REASON_WITHDRAWN: &str = "bid withdrawn";
pub const REASON_NOT_OPEN: &str = "resource is not open for bidding";
pub const REASON_SHUTDOWN: &str = "auction service is shutting down";

/// What a waiting bidder learns when its gate is released.
#[derive(Debug)]
pub enum BidOutcome {
    Rejected { reason: String },
    /// The bid won; `ended` fires when its compute phase has been settled.
    Accepted { ended: oneshot::Receiver<()> },
    /// The window could not be resolved.
    Failed { reason: String },
}

/// Why a leader is being released without winning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceReason {
    /// The owner withdrew the resource; the slot goes idle.
    Revoked,
    /// Resolving the window failed; the slot stays open for the next window.
    Failure(String),
    /// The process is stopping; the slot is dropped.
    Shutdown,
}

/// Result of installing a bid in the registry.
#[derive(Debug)]
pub struct Placement {
    pub outcome: oneshot::Receiver<BidOutcome>,
    /// The bid that lost as a consequence: the displaced leader, or the
    /// incoming bid itself when it could not take the lead.
    pub superseded: Option<Bid>,
}

struct Leader {
    bid: Bid,
    gate: oneshot::Sender<BidOutcome>,
}

impl Leader {
    fn release(self, outcome: BidOutcome) -> Bid {
        // The bidder may have gone away; the outcome stands regardless.
        let _ = self.gate.send(outcome);
        self.bid
    }
}

enum SlotPhase {
    Idle,
    Open {
        leader: Option<Leader>,
    },
    /// The window closed with `winner`. `ended` is parked here when the
    /// winner has not reached the registry yet.
    Awarded {
        winner: Bid,
        ended: Option<oneshot::Receiver<()>>,
    },
}

struct AuctionSlot {
    owner: UserId,
    phase: SlotPhase,
    events: broadcast::Sender<ResourceEvent>,
}

impl AuctionSlot {
    fn new(owner: UserId, phase: SlotPhase) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            owner,
            phase,
            events,
        }
    }

    fn take_leader(&mut self) -> Option<Leader> {
        match &mut self.phase {
            SlotPhase::Open { leader } => leader.take(),
            _ => None,
        }
    }
}

fn settled(outcome: BidOutcome) -> oneshot::Receiver<BidOutcome> {
    let (gate, rx) = oneshot::channel();
    let _ = gate.send(outcome);
    rx
}

fn rejected(reason: impl Into<String>) -> BidOutcome {
    BidOutcome::Rejected {
        reason: reason.into(),
    }
}

#[derive(Default)]
pub struct AuctionRegistry {
    slots: Mutex<HashMap<ResourceId, AuctionSlot>>,
}

impl AuctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the resource's slot accept bids. An open or awarded slot is
    /// left as it is.
    pub fn open(&self, rid: ResourceId, owner: UserId) {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(rid)
            .or_insert_with(|| AuctionSlot::new(owner, SlotPhase::Idle));
        slot.owner = owner;
        if matches!(slot.phase, SlotPhase::Idle) {
            slot.phase = SlotPhase::Open { leader: None };
        }
    }

    /// Starts a fresh window after a compute phase.
    pub fn rearm(&self, rid: ResourceId) {
        if let Some(slot) = self.slots.lock().get_mut(&rid) {
            if !matches!(slot.phase, SlotPhase::Open { .. }) {
                slot.phase = SlotPhase::Open { leader: None };
            }
        }
    }

    /// Installs `bid` as the leader of its resource if it beats the current
    /// one, releasing the previous leader as rejected. A bid that cannot lead
    /// is rejected at once, so leader amounts never decrease within a window.
    pub fn place_leader(&self, bid: Bid) -> Placement {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&bid.rid) else {
            return Placement {
                outcome: settled(rejected(REASON_NOT_OPEN)),
                superseded: Some(bid),
            };
        };

        match &mut slot.phase {
            SlotPhase::Idle => Placement {
                outcome: settled(rejected(REASON_NOT_OPEN)),
                superseded: Some(bid),
            },
            SlotPhase::Awarded { winner, ended } => {
                if winner.bid == bid.bid {
                    let outcome = match ended.take() {
                        Some(ended) => BidOutcome::Accepted { ended },
                        None => BidOutcome::Failed {
                            reason: "bid was already awarded".to_string(),
                        },
                    };
                    Placement {
                        outcome: settled(outcome),
                        superseded: None,
                    }
                } else {
                    Placement {
                        outcome: settled(rejected(winner.preemption_reason())),
                        superseded: Some(bid),
                    }
                }
            }
            SlotPhase::Open { leader } => {
                if let Some(current) = leader.as_ref() {
                    if !bid.beats(&current.bid) {
                        debug!(rid = %bid.rid, bid = %bid.bid, leader = %current.bid.bid, "bid arrived behind leader");
                        let reason = current.bid.preemption_reason();
                        return Placement {
                            outcome: settled(rejected(reason)),
                            superseded: Some(bid),
                        };
                    }
                }

                let reason = bid.preemption_reason();
                let (gate, outcome) = oneshot::channel();
                let previous = leader.replace(Leader { bid, gate });
                let superseded = previous.map(|prev| prev.release(rejected(reason)));
                if let Some(prev) = &superseded {
                    debug!(rid = %prev.rid, bid = %prev.bid, "leader preempted");
                }
                Placement {
                    outcome,
                    superseded,
                }
            }
        }
    }

    /// Closes the window in favour of `winner`. Returns the leader that was
    /// released as rejected if it was some other bid.
    pub fn award(
        &self,
        rid: ResourceId,
        winner: &Bid,
        ended: oneshot::Receiver<()>,
    ) -> Option<Bid> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&rid)?;

        let mut ended = Some(ended);
        let mut displaced = None;
        if let Some(leader) = slot.take_leader() {
            if leader.bid.bid == winner.bid {
                if let Some(ended) = ended.take() {
                    leader.release(BidOutcome::Accepted { ended });
                }
            } else {
                displaced = Some(leader.release(rejected(winner.preemption_reason())));
            }
        }

        slot.phase = SlotPhase::Awarded {
            winner: winner.clone(),
            ended,
        };
        displaced
    }

    /// Ends a window in which the store found nothing to award. Any leader
    /// still registered is released as rejected and the slot reopens.
    pub fn expire(&self, rid: ResourceId) -> Option<Bid> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&rid)?;
        let stale = slot.take_leader();
        slot.phase = SlotPhase::Open { leader: None };
        stale.map(|leader| leader.release(rejected("no bid was pending when the auction closed")))
    }

    /// Releases the current leader without a win.
    pub fn force_reject(&self, rid: ResourceId, reason: ForceReason) -> Option<Bid> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&rid)?;
        let leader = slot.take_leader();
        let outcome = match &reason {
            ForceReason::Revoked => rejected(REASON_REVOKED),
            ForceReason::Failure(reason) => BidOutcome::Failed {
                reason: reason.clone(),
            },
            ForceReason::Shutdown => BidOutcome::Failed {
                reason: REASON_SHUTDOWN.to_string(),
            },
        };
        let released = leader.map(|leader| leader.release(outcome));

        match reason {
            ForceReason::Revoked => slot.phase = SlotPhase::Idle,
            ForceReason::Failure(_) => slot.phase = SlotPhase::Open { leader: None },
            ForceReason::Shutdown => {
                slots.remove(&rid);
            }
        }
        released
    }

    /// Withdraws `bid` if it currently leads. Returns whether it did.
    pub fn withdraw(&self, rid: ResourceId, bid: BidId) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&rid) else {
            return false;
        };
        if let SlotPhase::Open { leader } = &mut slot.phase {
            if leader.as_ref().map(|l| l.bid.bid) == Some(bid) {
                if let Some(leader) = leader.take() {
                    leader.release(rejected(REASON_WITHDRAWN));
                    return true;
                }
            }
        }
        false
    }

    pub fn leader(&self, rid: ResourceId) -> Option<Bid> {
        let slots = self.slots.lock();
        match &slots.get(&rid)?.phase {
            SlotPhase::Open { leader } => leader.as_ref().map(|l| l.bid.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self, rid: ResourceId) -> bool {
        matches!(
            self.slots.lock().get(&rid).map(|s| &s.phase),
            Some(SlotPhase::Open { .. })
        )
    }

    /// The other end of a connection on `rid`: the owner for a renter, or the
    /// current winner (or leader) for the owner.
    pub fn peer(&self, rid: ResourceId, uid: UserId) -> Option<UserId> {
        let slots = self.slots.lock();
        let slot = slots.get(&rid)?;
        if uid != slot.owner {
            return Some(slot.owner);
        }
        match &slot.phase {
            SlotPhase::Awarded { winner, .. } => Some(winner.renter),
            SlotPhase::Open { leader } => leader.as_ref().map(|l| l.bid.renter),
            SlotPhase::Idle => None,
        }
    }

    pub fn subscribe(&self, rid: ResourceId) -> Option<broadcast::Receiver<ResourceEvent>> {
        Some(self.slots.lock().get(&rid)?.events.subscribe())
    }

    pub fn publish(&self, rid: ResourceId, event: ResourceEvent) {
        if let Some(slot) = self.slots.lock().get(&rid) {
            // No subscribers is fine: loaner streams are optional.
            let _ = slot.events.send(event);
        }
    }

    /// Drops the slot, releasing any leader as rejected.
    pub fn remove(&self, rid: ResourceId) {
        if let Some(mut slot) = self.slots.lock().remove(&rid) {
            if let Some(leader) = slot.take_leader() {
                leader.release(rejected(REASON_REVOKED));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
