//! Shared data types for the compute marketplace.
//!
//! Everything that crosses a crate boundary lives here: identifiers, resource
//! descriptions, bids and their ordering, and the account summary returned to
//! clients.

pub mod account;
pub mod bid;
pub mod error;
pub mod ids;
pub mod resource;

pub use account::{Credentials, UserInfo};
pub use bid::{Bid, BidRequest, BidStatus};
pub use error::ValidationError;
pub use ids::{BidId, ResourceId, UserId};
pub use resource::{PageDirection, Resource, ResourceSpec, PAGE_SIZE};
