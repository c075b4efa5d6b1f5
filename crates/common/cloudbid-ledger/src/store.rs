use async_trait::async_trait;
use cloudbid_types::{
    Bid, BidId, BidRequest, PageDirection, Resource, ResourceId, ResourceSpec, UserId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("{0} not found")]
    NotFound(String),

    #[error("resource is not available for bidding")]
    ResourceNotBiddable,

    #[error("resource is currently computing")]
    ResourceComputing,

    #[error("cannot bid on your own resource")]
    OwnResource,

    #[error("insufficient credits to place bid, only {available:.2} credits available and your total bid amount is {attempted:.2}")]
    InsufficientCredits { available: f64, attempted: f64 },

    #[error("bid amount {amount} is not above the resource cost per minute {floor}")]
    BidBelowFloor { amount: f64, floor: f64 },

    #[error("existing bid is better or equal")]
    BidNotCompetitive,

    #[error("resource is still available, please make it unavailable before removing")]
    ResourceStillAvailable,

    #[error("bid {0} is currently computing")]
    BidComputing(BidId),

    #[error("bid {0} is not computing")]
    NotComputing(BidId),

    #[error("schema mismatch on table {table}: expected columns {expected:?}, found {found:?}")]
    SchemaMismatch {
        table: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn resource_not_found(rid: ResourceId) -> Self {
        StoreError::NotFound(format!("resource {rid}"))
    }

    pub fn bid_not_found(bid: BidId) -> Self {
        StoreError::NotFound(format!("bid {bid}"))
    }

    pub fn user_not_found(uid: UserId) -> Self {
        StoreError::NotFound(format!("wallet of user {uid}"))
    }
}

/// Result of resolving an auction window in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AwardOutcome {
    /// `winner` is now accepted and computing; `rejected` lists every other
    /// bid that was pending when the window closed.
    Awarded { winner: Bid, rejected: Vec<BidId> },
    /// Nothing was pending; the resource stays available.
    NoBids,
    /// The resource was revoked or deleted before the window closed.
    Withdrawn,
}

/// Credit transfer at the end of a compute phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOrder {
    pub rid: ResourceId,
    pub bid: BidId,
    pub loaner: UserId,
    pub renter: UserId,
    pub amount: f64,
}

/// Transactional surface over users, wallets, resources and bids.
///
/// Every method that mutates more than one row does so atomically. Methods
/// that lock wallets take them in ascending uid order.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Looks up a user by hashed name, registering it (with an empty wallet)
    /// when unknown. Returns the uid and whether it was newly created.
    async fn register_or_authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(UserId, bool), StoreError>;

    async fn issue_session_token(&self, uid: UserId, token: &str) -> Result<(), StoreError>;

    /// `None` when the token is not on record.
    async fn resolve_token(&self, token: &str) -> Result<Option<UserId>, StoreError>;

    async fn revoke_token(&self, token: &str) -> Result<(), StoreError>;

    async fn revoke_tokens_of_user(&self, uid: UserId) -> Result<u64, StoreError>;

    /// New resources start unavailable.
    async fn create_resource(
        &self,
        owner: UserId,
        spec: &ResourceSpec,
    ) -> Result<ResourceId, StoreError>;

    /// Refuses while the resource is available. Terminal bids on it go with it.
    async fn delete_resource(&self, rid: ResourceId) -> Result<(), StoreError>;

    /// Toggles `available` and returns the new value. Refuses while computing.
    async fn flip_availability(&self, rid: ResourceId) -> Result<bool, StoreError>;

    async fn is_available(&self, rid: ResourceId) -> Result<bool, StoreError>;

    async fn owner_of(&self, rid: ResourceId) -> Result<UserId, StoreError>;

    async fn get_resource(&self, rid: ResourceId) -> Result<Resource, StoreError>;

    async fn list_owned_resources(&self, uid: UserId) -> Result<Vec<Resource>, StoreError>;

    /// Up to [`cloudbid_types::PAGE_SIZE`] available resources owned by someone
    /// other than `viewer`, strictly before or after `pivot`, ascending by rid.
    async fn page_available_resources(
        &self,
        viewer: UserId,
        pivot: ResourceId,
        direction: PageDirection,
    ) -> Result<Vec<Resource>, StoreError>;

    /// Resources that are available and idle; used to resume auctions on boot.
    async fn list_auctionable_resources(&self) -> Result<Vec<Resource>, StoreError>;

    /// Admits a bid as pending. Checks, in one transaction: the resource is
    /// biddable, the renter's escrow covers the new commitment, the amount
    /// beats the floor, and the bid beats the current pending leader.
    async fn insert_bid(&self, renter: UserId, request: &BidRequest) -> Result<Bid, StoreError>;

    async fn get_bid(&self, bid: BidId) -> Result<Bid, StoreError>;

    async fn bid_owner(&self, bid: BidId) -> Result<UserId, StoreError>;

    /// Removes a bid and returns it as it was. Refuses while it is computing.
    async fn delete_bid(&self, bid: BidId) -> Result<Bid, StoreError>;

    async fn list_user_bids(&self, uid: UserId) -> Result<Vec<Bid>, StoreError>;

    async fn has_bid_on_resource(&self, uid: UserId, rid: ResourceId) -> Result<bool, StoreError>;

    /// Rejects a bid that is still pending or processing. Returns whether the
    /// status changed.
    async fn mark_bid_rejected(&self, bid: BidId) -> Result<bool, StoreError>;

    /// Accepts a bid and marks it (and its resource) computing. Fails if
    /// another bid is already computing on the resource.
    async fn mark_bid_accepted(&self, bid: BidId) -> Result<Bid, StoreError>;

    /// Resolves an auction window: the best pending bid is accepted and
    /// computing, every other pending bid is rejected.
    async fn pick_max_bid(&self, rid: ResourceId) -> Result<AwardOutcome, StoreError>;

    /// Rejects every pending bid on the resource; returns the affected ids.
    async fn reject_pending_bids(&self, rid: ResourceId) -> Result<Vec<BidId>, StoreError>;

    /// Moves `amount` from renter to loaner and clears the computing flags of
    /// the bid and the resource.
    async fn settle(&self, order: &SettlementOrder) -> Result<(), StoreError>;

    /// Adds credits to a wallet and returns the new balance.
    async fn add_credits(&self, uid: UserId, amount: f64) -> Result<f64, StoreError>;

    async fn credits(&self, uid: UserId) -> Result<f64, StoreError>;

    async fn count_resources(&self, uid: UserId) -> Result<i64, StoreError>;

    async fn count_active_resources(&self, uid: UserId) -> Result<i64, StoreError>;

    /// Σ amount·duration over the user's pending bids.
    async fn pending_bid_commitment(&self, uid: UserId) -> Result<f64, StoreError>;

    async fn count_running_accepted_bids(&self, uid: UserId) -> Result<i64, StoreError>;
}
