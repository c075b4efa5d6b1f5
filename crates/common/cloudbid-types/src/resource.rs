use crate::error::ValidationError;
use crate::ids::{ResourceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Maximum number of resources returned by one page of the marketplace listing.
pub const PAGE_SIZE: i64 = 20;

/// Static description of a machine offered for rent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "cpuCores")]
    pub cpu_cores: i32,
    /// Memory in GB.
    #[serde(rename = "memory")]
    pub memory_gb: i32,
    /// Storage in GB.
    #[serde(rename = "storage")]
    pub storage_gb: i32,
    /// GPU model, e.g. "NVIDIA GeForce RTX 3080".
    pub gpu: String,
    /// Bandwidth in Mbps.
    #[serde(rename = "bandwidth")]
    pub bandwidth_mbps: i32,
    /// Floor price: a bid's per-minute amount must strictly exceed it.
    #[serde(rename = "costPerMinute")]
    pub cost_per_minute: f64,
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cpu_cores <= 0 {
            return Err(ValidationError::NotPositive { field: "cpuCores" });
        }
        if self.memory_gb < 0 {
            return Err(ValidationError::Negative { field: "memory" });
        }
        if self.storage_gb < 0 {
            return Err(ValidationError::Negative { field: "storage" });
        }
        if self.bandwidth_mbps < 0 {
            return Err(ValidationError::Negative { field: "bandwidth" });
        }
        if self.gpu.trim().is_empty() {
            return Err(ValidationError::Empty { field: "gpu" });
        }
        if !self.cost_per_minute.is_finite() {
            return Err(ValidationError::NotFinite { field: "costPerMinute" });
        }
        if self.cost_per_minute < 0.0 {
            return Err(ValidationError::Negative { field: "costPerMinute" });
        }
        Ok(())
    }
}

/// A published resource with its lifecycle flags.
///
/// `available` means the owner has offered it; `computing` means a winning bid
/// is executing on it. A computing resource is always available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub rid: ResourceId,
    #[serde(rename = "uid")]
    pub owner: UserId,
    #[serde(flatten)]
    pub spec: ResourceSpec,
    pub available: bool,
    pub computing: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Open for new bids: offered and not running anything.
    pub fn is_biddable(&self) -> bool {
        self.available && !self.computing
    }
}

/// Direction of a marketplace page relative to its pivot resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum PageDirection {
    /// Resources with `rid < pivot`.
    Prev,
    /// Resources with `rid > pivot`.
    Next,
}

impl PageDirection {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        raw.parse()
            .map_err(|_| ValidationError::InvalidDirection(raw.to_string()))
    }
}
