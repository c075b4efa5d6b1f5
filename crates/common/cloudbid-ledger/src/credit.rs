use cloudbid_types::{Bid, BidRequest, UserId, UserInfo, ValidationError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::policy::SettlementPolicy;
use crate::store::{MarketStore, SettlementOrder, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credits to place bid, only {available:.2} credits available and your total bid amount is {attempted:.2}")]
    InsufficientCredits { available: f64, attempted: f64 },

    #[error("{0}")]
    ResourceNotBiddable(String),

    #[error("bid amount {amount} must be greater than the resource cost per minute {floor}")]
    BidBelowFloor { amount: f64, floor: f64 },

    #[error("existing bid is better or equal")]
    BidNotCompetitive,

    #[error("invalid bid: {0}")]
    InvalidBid(#[from] ValidationError),

    #[error("invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("{0}")]
    NotFound(String),

    #[error("store failure: {0}")]
    InternalStoreFailure(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { available, attempted } => {
                LedgerError::InsufficientCredits { available, attempted }
            }
            StoreError::ResourceNotBiddable
            | StoreError::ResourceComputing
            | StoreError::OwnResource => LedgerError::ResourceNotBiddable(err.to_string()),
            StoreError::BidBelowFloor { amount, floor } => {
                LedgerError::BidBelowFloor { amount, floor }
            }
            StoreError::BidNotCompetitive => LedgerError::BidNotCompetitive,
            StoreError::NotFound(what) => LedgerError::NotFound(format!("{what} not found")),
            other => LedgerError::InternalStoreFailure(other),
        }
    }
}

impl LedgerError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InsufficientCredits { .. } => "insufficient_credits",
            LedgerError::ResourceNotBiddable(_) => "not_biddable",
            LedgerError::BidBelowFloor { .. } => "below_floor",
            LedgerError::BidNotCompetitive => "not_competitive",
            LedgerError::InvalidBid(_) | LedgerError::InvalidAmount(_) => "invalid",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::InternalStoreFailure(_) => "internal",
        }
    }
}

/// A completed transfer from renter to loaner.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub order: SettlementOrder,
    pub elapsed_minutes: f64,
}

/// Gatekeeper for every operation that admits escrow or moves credits.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn MarketStore>,
    policy: SettlementPolicy,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn MarketStore>, policy: SettlementPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn policy(&self) -> SettlementPolicy {
        self.policy
    }

    /// Admits a bid as pending. The escrow check and the insert share one
    /// store transaction, so concurrent placements cannot both squeeze past
    /// a marginal balance.
    pub async fn admit(&self, renter: UserId, request: &BidRequest) -> Result<Bid, LedgerError> {
        let result = self.try_admit(renter, request).await;

        match &result {
            Ok(bid) => {
                metrics::counter!("cloudbid_bids_placed_total").increment(1);
                debug!(bid = %bid.bid, rid = %bid.rid, uid = %renter, amount = bid.amount, duration = bid.duration, "bid admitted");
            }
            Err(err) => {
                metrics::counter!("cloudbid_bids_rejected_total", "reason" => err.kind()).increment(1);
                debug!(rid = %request.rid, uid = %renter, error = %err, "bid refused");
            }
        }
        result
    }

    async fn try_admit(&self, renter: UserId, request: &BidRequest) -> Result<Bid, LedgerError> {
        request.validate()?;
        Ok(self.store.insert_bid(renter, request).await?)
    }

    /// Charges the renter of a finished (or interrupted) compute phase and
    /// pays the loaner. The charge follows the configured policy.
    pub async fn settle(
        &self,
        winner: &Bid,
        loaner: UserId,
        elapsed_minutes: f64,
    ) -> Result<Settlement, LedgerError> {
        let amount = self
            .policy
            .charge(winner.amount, winner.duration, elapsed_minutes);
        let order = SettlementOrder {
            rid: winner.rid,
            bid: winner.bid,
            loaner,
            renter: winner.renter,
            amount,
        };

        match self.store.settle(&order).await {
            Ok(()) => {
                metrics::counter!("cloudbid_settlements_total", "status" => "success").increment(1);
                metrics::histogram!("cloudbid_settlement_amount").record(amount);
                info!(
                    bid = %order.bid,
                    rid = %order.rid,
                    renter = %order.renter,
                    loaner = %order.loaner,
                    amount,
                    "settled compute"
                );
                Ok(Settlement {
                    order,
                    elapsed_minutes,
                })
            }
            Err(err) => {
                metrics::counter!("cloudbid_settlements_total", "status" => "error").increment(1);
                warn!(bid = %order.bid, rid = %order.rid, error = %err, "settlement failed");
                Err(err.into())
            }
        }
    }

    /// Tops up a wallet; returns the new balance.
    pub async fn top_up(&self, uid: UserId, amount: f64) -> Result<f64, LedgerError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let balance = self.store.add_credits(uid, amount).await?;
        info!(uid = %uid, amount, balance, "credits added");
        Ok(balance)
    }

    pub async fn user_info(&self, uid: UserId) -> Result<UserInfo, LedgerError> {
        Ok(UserInfo {
            credits: self.store.credits(uid).await?,
            resources: self.store.count_resources(uid).await?,
            active_resources: self.store.count_active_resources(uid).await?,
            pending_bids: self.store.pending_bid_commitment(uid).await?,
            active_loans: self.store.count_running_accepted_bids(uid).await?,
        })
    }
}
