use async_trait::async_trait;
use cm_types::{SnapshotId, TabletId};

/// The narrow tablet-server RPC surface the orchestrator dispatches against
/// (§6 "Tablet-server RPCs issued by the master"). Transport itself is out of
/// scope; a production implementation wraps the real RPC client and maps
/// timeouts/unreachability to `false` after its own retry budget is spent
/// (§5 "Cancellation and timeouts").
#[async_trait]
pub trait SnapshotAgent: Send + Sync {
    async fn create_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: &SnapshotId) -> bool;
    async fn restore_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: &SnapshotId) -> bool;
    async fn delete_tablet_snapshot(&self, tablet_id: &TabletId, snapshot_id: &SnapshotId) -> bool;
}
