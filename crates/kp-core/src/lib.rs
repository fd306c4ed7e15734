//! Core primitives shared across the kvpilot control plane
//!
//! Defines the fixed hash-slot space, the compact slot-range codec used in
//! persisted topology, and the node identity/role types every other crate
//! builds on. No I/O and no async here.

pub mod slots;

pub use slots::{expand_ranges, encode_ranges, even_split, SlotRangeError, TOTAL_SLOTS};

use serde::{Deserialize, Serialize};

/// Node identity string, as known to the cluster protocol (40 hex chars)
pub type NodeId = String;

/// Replication role of a node within its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    /// Wire protocol calls replicas "slave"; keep the name it answers to
    #[serde(rename = "slave")]
    Replica,
}

impl Default for Role {
    fn default() -> Self {
        Self::Replica
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Replica => write!(f, "slave"),
        }
    }
}

impl Role {
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }
}
