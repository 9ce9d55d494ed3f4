//! Shared identifiers, lifecycle enums, and time primitives used across the
//! catalog manager crates.
//!
//! Every entity in the system is addressed by an opaque string id, generated
//! once by the leader at creation time and never reused. We wrap each id
//! flavor in its own newtype so that a `TableId` can never be passed where a
//! `TabletId` is expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a new, globally unique id. Ids are never reused.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(NamespaceId, "ns");
opaque_id!(TableId, "tbl");
opaque_id!(TabletId, "tablet");
opaque_id!(TsId, "ts");
opaque_id!(SnapshotId, "snap");
opaque_id!(StreamId, "stream");
opaque_id!(UniverseId, "universe");

/// The monotonically increasing Raft term of the master leader. Used as a
/// fencing token for sys-catalog writes (§4.1, §5).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaderTerm(pub u64);

impl LeaderTerm {
    pub fn next(self) -> Self {
        LeaderTerm(self.0 + 1)
    }
}

impl fmt::Display for LeaderTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term={}", self.0)
    }
}

/// A hybrid-time timestamp: a physical-clock component packed with a logical
/// counter, represented as the unsigned 64-bit integer the wire format uses
/// (§6, XCluster safe-time table). Comparison is purely on the packed value,
/// which is what gives safe-time monotonicity its simple implementation
/// (§9 "Clock-skew dependence").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(pub u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);

    /// Advances a local clock so it reads strictly past `received`, modeling
    /// the cross-node invariant in §9: any hybrid time produced on node A and
    /// sent to node B causes B's clock to advance past it before B emits
    /// further timestamps.
    pub fn advance_past(&mut self, received: HybridTime) {
        if received.0 >= self.0 {
            self.0 = received.0 + 1;
        }
    }
}

/// A process-local monotonic hybrid clock. Not wall-clock accurate; suitable
/// for ordering and for the tests in §8 that exercise safe-time monotonicity.
#[derive(Debug, Default)]
pub struct HybridClock(AtomicU64);

impl HybridClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn now(&self) -> HybridTime {
        HybridTime(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn update(&self, observed: HybridTime) {
        self.0.fetch_max(observed.0, Ordering::SeqCst);
    }
}

/// Namespace lifecycle (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceState {
    Created,
    Deleting,
    Deleted,
}

/// Table lifecycle (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Preparing,
    Running,
    Deleting,
    Deleted,
}

/// Tablet lifecycle (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Preparing,
    Running,
    Deleted,
}

/// Per-replica role within a tablet's Raft peer group (§3, §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Learner,
}

/// Raft membership type, distinguishing voting replicas from read replicas
/// (§4.4 GLOSSARY: "Live replica" vs "read replica").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    Voter,
    PreVoter,
    Observer,
}

/// Snapshot lifecycle (§3). `Restoring` is reachable only from `Complete`;
/// `Failed`/`Cancelled`/`Deleted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Creating,
    Complete,
    Restoring,
    Deleting,
    Deleted,
    Failed,
    Cancelled,
}

impl SnapshotState {
    /// True for the states enumerated by §8 testable property 2: a snapshot
    /// may be in at most one non-terminal control state system-wide.
    pub fn is_terminal_control_state(self) -> bool {
        matches!(
            self,
            SnapshotState::Complete
                | SnapshotState::Failed
                | SnapshotState::Cancelled
                | SnapshotState::Deleted
        )
    }
}

/// Per-tablet state within a snapshot (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletSnapshotState {
    Creating,
    Complete,
    Restoring,
    Deleting,
    Failed,
}

/// CDC stream lifecycle (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdcStreamState {
    Active,
    Deleting,
    Deleted,
}

/// Universe replication lifecycle (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniverseReplicationState {
    Initializing,
    Validated,
    Active,
    Disabled,
    Deleted,
    DeletedError,
    Failed,
}

/// A placement constraint: how many voting replicas, and how they must be
/// distributed across cloud/region/zone blocks (§4.4).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementInfo {
    pub num_replicas: u32,
    pub placement_blocks: Vec<PlacementBlock>,
    /// Matches tablet servers registered under this placement uuid only; an
    /// empty string matches servers with an empty placement uuid (§4.3).
    pub placement_uuid: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementBlock {
    pub cloud: String,
    pub region: String,
    pub zone: String,
    pub min_num_replicas: u32,
}

impl PlacementBlock {
    pub fn matches(&self, cloud: &str, region: &str, zone: &str) -> bool {
        self.cloud == cloud && self.region == region && self.zone == zone
    }
}

/// A full placement policy: synchronous (live) replicas plus zero or more
/// read-replica placements (§4.4). When present on a `Table`, overrides the
/// cluster-wide policy on `ClusterConfig` (§3).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub live_replicas: PlacementInfo,
    pub read_replicas: Vec<PlacementInfo>,
}
