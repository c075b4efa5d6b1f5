//! Live auctions over compute resources.
//!
//! The [`AuctionRegistry`] holds the leading bid of every open resource and
//! the gate its bidder waits on. An [`AuctionCoordinator`] task per resource
//! closes windows, runs compute timers and triggers settlement through the
//! [`cloudbid_ledger::CreditLedger`]. [`AuctionService`] ties both to the
//! store for the HTTP layer.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod registry;
pub mod service;

pub use coordinator::{AuctionCoordinator, AuctionTimings};
pub use error::AuctionError;
pub use events::{event_channel, EventSink, EventStream, ResourceEvent, StreamClosed, StreamFrame};
pub use registry::{AuctionRegistry, BidOutcome, ForceReason, Placement};
pub use service::{AuctionService, Availability};
