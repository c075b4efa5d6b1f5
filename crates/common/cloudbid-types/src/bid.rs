use crate::error::ValidationError;
use crate::ids::{BidId, ResourceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum_macros::{AsRefStr, Display, EnumString};

/// Lifecycle status of a bid as persisted in `bids.status`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BidStatus {
    Pending,
    /// Transient while an auction window is being resolved.
    Processing,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BidStatus::Accepted | BidStatus::Rejected)
    }
}

/// A renter's offer for a resource: `amount` credits per minute for `duration` minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bid: BidId,
    #[serde(rename = "uid")]
    pub renter: UserId,
    pub rid: ResourceId,
    pub amount: f64,
    pub duration: i32,
    pub status: BidStatus,
    /// True only while this bid is the one executing on its resource.
    pub computing: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Bid {
    /// Credits held in escrow for this bid while it is pending or running.
    pub fn commitment(&self) -> f64 {
        commitment(self.amount, self.duration)
    }

    /// Strictly better offer: higher amount, or equal amount and longer duration.
    pub fn beats(&self, other: &Bid) -> bool {
        beats(self.amount, self.duration, other.amount, other.duration)
    }

    /// Auction ranking used when a window closes. Greater is better; equal
    /// offers fall back to earliest creation, then lowest id.
    pub fn rank(&self, other: &Bid) -> Ordering {
        self.amount
            .total_cmp(&other.amount)
            .then(self.duration.cmp(&other.duration))
            .then(other.created_at.cmp(&self.created_at))
            .then(other.bid.cmp(&self.bid))
    }

    /// Reason reported to a bidder that this bid has displaced.
    pub fn preemption_reason(&self) -> String {
        format!(
            "A better bid with amount: {:.6} and duration: {}",
            self.amount, self.duration
        )
    }

    pub fn is_pending(&self) -> bool {
        self.status == BidStatus::Pending
    }
}

/// `amount * duration`, the escrow held for an offer.
pub fn commitment(amount: f64, duration: i32) -> f64 {
    amount * f64::from(duration)
}

/// Bid ordering on raw offers; see [`Bid::beats`].
pub fn beats(amount: f64, duration: i32, other_amount: f64, other_duration: i32) -> bool {
    amount > other_amount || (amount == other_amount && duration > other_duration)
}

/// Body of a bid placement request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    pub rid: ResourceId,
    pub amount: f64,
    pub duration: i32,
}

impl BidRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.amount.is_finite() {
            return Err(ValidationError::NotFinite { field: "amount" });
        }
        if self.amount < 0.0 {
            return Err(ValidationError::Negative { field: "amount" });
        }
        if self.duration <= 0 {
            return Err(ValidationError::NotPositive { field: "duration" });
        }
        Ok(())
    }

    pub fn commitment(&self) -> f64 {
        commitment(self.amount, self.duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bid(id: i64, amount: f64, duration: i32) -> Bid {
        Bid {
            bid: BidId(id),
            renter: UserId(1),
            rid: ResourceId(1),
            amount,
            duration,
            status: BidStatus::Pending,
            computing: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn higher_amount_beats() {
        assert!(bid(2, 6.0, 3).beats(&bid(1, 5.0, 3)));
        assert!(!bid(2, 5.0, 3).beats(&bid(1, 6.0, 30)));
    }

    #[test]
    fn equal_amount_longer_duration_beats() {
        assert!(bid(2, 5.0, 4).beats(&bid(1, 5.0, 3)));
        assert!(!bid(2, 5.0, 3).beats(&bid(1, 5.0, 3)));
    }

    #[test]
    fn rank_prefers_earliest_on_full_tie() {
        let mut early = bid(1, 5.0, 3);
        let mut late = bid(2, 5.0, 3);
        early.created_at = Utc::now() - Duration::seconds(5);
        late.created_at = Utc::now();
        assert_eq!(early.rank(&late), Ordering::Greater);
        assert_eq!(late.rank(&early), Ordering::Less);
    }

    #[test]
    fn preemption_reason_format() {
        assert_eq!(
            bid(9, 6.0, 3).preemption_reason(),
            "A better bid with amount: 6.000000 and duration: 3"
        );
    }

    #[test]
    fn commitment_is_amount_times_duration() {
        assert_eq!(bid(1, 5.0, 3).commitment(), 15.0);
        assert_eq!(commitment(1.0, 5), 5.0);
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!(BidStatus::Processing.to_string(), "processing");
        assert_eq!("accepted".parse::<BidStatus>().unwrap(), BidStatus::Accepted);
        assert_eq!(
            serde_json::to_string(&BidStatus::Rejected).unwrap(),
            "\"rejected\""
        );
        assert!(BidStatus::Rejected.is_terminal());
        assert!(!BidStatus::Pending.is_terminal());
    }

    #[test]
    fn request_validation() {
        let ok = BidRequest { rid: ResourceId(1), amount: 5.0, duration: 3 };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.commitment(), 15.0);

        let zero = BidRequest { duration: 0, ..ok.clone() };
        assert_eq!(
            zero.validate(),
            Err(ValidationError::NotPositive { field: "duration" })
        );

        let inf = BidRequest { amount: f64::INFINITY, ..ok };
        assert!(inf.validate().is_err());
    }
}
