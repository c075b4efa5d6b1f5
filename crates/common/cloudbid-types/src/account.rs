use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Login body. Values are hashed before they reach the store.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::Empty { field: "username" });
        }
        if self.password.is_empty() {
            return Err(ValidationError::Empty { field: "password" });
        }
        Ok(())
    }
}

/// Account summary returned by the user-info endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub credits: f64,
    /// Number of resources the user owns.
    pub resources: i64,
    /// Owned resources currently running a winning bid.
    pub active_resources: i64,
    /// Escrow commitment of the user's pending bids.
    pub pending_bids: f64,
    /// The user's accepted bids that are still computing.
    pub active_loans: i64,
}
