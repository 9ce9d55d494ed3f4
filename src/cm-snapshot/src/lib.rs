//! Snapshot lifecycle orchestration (§4.6): create/restore/delete of
//! multi-tablet snapshots under a single in-flight interlock, and
//! cross-cluster import of a producer snapshot's entries (§4.7 stage 3).

mod agent;
mod error;
mod import;
mod orchestrator;

pub use agent::SnapshotAgent;
pub use error::SnapshotError;
pub use import::{import, TabletIdMap};
pub use orchestrator::{SnapshotOpStatus, SnapshotOrchestrator};
