use cloudbid_ledger::{LedgerError, StoreError};
use cloudbid_types::{BidId, ResourceId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum AuctionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("user {uid} does not own resource {rid}")]
    NotResourceOwner { uid: UserId, rid: ResourceId },

    #[error("user {uid} does not own bid {bid}")]
    NotBidOwner { uid: UserId, bid: BidId },

    #[error("auction service is shutting down")]
    ShuttingDown,
}
