//! Bid admission rules shared by every store backend. Callers gather the
//! inputs under their own locks; the checks run in a fixed order so both
//! backends report the same error for the same state.

use crate::store::StoreError;
use cloudbid_types::bid::beats;
use cloudbid_types::{BidRequest, Resource, UserId};

/// Snapshot of everything a placement is judged against.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionInputs<'a> {
    pub renter: UserId,
    pub resource: &'a Resource,
    /// Wallet balance of the renter.
    pub credits: f64,
    /// Escrow already held by the renter's pending and running bids.
    pub committed: f64,
    /// `(amount, duration)` of the best pending bid on the resource.
    pub leader: Option<(f64, i32)>,
}

pub fn check_admission(inputs: &AdmissionInputs<'_>, request: &BidRequest) -> Result<(), StoreError> {
    let resource = inputs.resource;
    if !resource.available {
        return Err(StoreError::ResourceNotBiddable);
    }
    if resource.computing {
        return Err(StoreError::ResourceComputing);
    }
    if resource.owner == inputs.renter {
        return Err(StoreError::OwnResource);
    }

    let attempted = inputs.committed + request.commitment();
    if inputs.credits < attempted {
        return Err(StoreError::InsufficientCredits {
            available: inputs.credits,
            attempted,
        });
    }

    if request.amount <= resource.spec.cost_per_minute {
        return Err(StoreError::BidBelowFloor {
            amount: request.amount,
            floor: resource.spec.cost_per_minute,
        });
    }

    if let Some((amount, duration)) = inputs.leader {
        if !beats(request.amount, request.duration, amount, duration) {
            return Err(StoreError::BidNotCompetitive);
        }
    }

    Ok(())
}
