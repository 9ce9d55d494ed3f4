use async_trait::async_trait;
use cm_types::{HybridTime, TabletId};

/// The data-plane RPC surface for purging CDC state rows, opened against a
/// tablet hosting the CDC state table (§4.8). Transport is out of scope
/// (§1); a production implementation wraps the real tablet-server client.
#[async_trait]
pub trait CdcStateCleaner: Send + Sync {
    /// Deletes every `(tablet_id, stream_id)` row for `tablet_id`. Returns
    /// `false` on any failure; the caller leaves the owning stream
    /// `DELETING` and retries on the next run.
    async fn delete_rows(&self, tablet_id: &TabletId, stream_id: &cm_types::StreamId) -> bool;
}

/// Reports producer-side safe-time readings for the XCluster safe-time
/// service (§4.8, §9 "Clock-skew dependence").
#[async_trait]
pub trait SafeTimeSource: Send + Sync {
    /// The latest safe time reported for a producer tablet, or `None` if
    /// currently unreachable (the row is left at its last known value).
    async fn producer_tablet_safe_time(&self, producer_tablet_id: &str) -> Option<HybridTime>;

    /// The ceiling every namespace's recomputed safe time is clamped to.
    async fn system_namespace_safe_time(&self) -> HybridTime;
}
