use async_trait::async_trait;
use cm_catalog::{Partition, TableSchema};

/// A producer-side table's identity and schema, as reported by the
/// producer cluster during universe replication setup (§4.7 stage 2).
#[derive(Clone, Debug)]
pub struct ProducerTableInfo {
    pub namespace: String,
    pub name: String,
    pub schema: TableSchema,
}

/// A producer-side tablet's partition range, used to resolve the
/// producer→consumer tablet map installed in stage 4.
#[derive(Clone, Debug)]
pub struct ProducerTabletInfo {
    pub id: String,
    pub partition: Partition,
}

/// The RPC surface the master opens against a producer cluster while
/// setting up universe replication (§4.7). Transport itself is out of
/// scope (§1); a production implementation wraps the real producer-client
/// RPC stub and maps timeouts/unreachability the way tablet-server RPCs
/// do (§5 "Cancellation and timeouts").
#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn fetch_table_schema(&self, producer_table_id: &str) -> Option<ProducerTableInfo>;

    async fn list_tablets(&self, producer_table_id: &str) -> Vec<ProducerTabletInfo>;

    /// Creates a new CDC stream on the producer for `producer_table_id`,
    /// returning its id.
    async fn create_stream(&self, producer_table_id: &str) -> Option<String>;

    /// True if `bootstrap_id` names an existing producer-side stream whose
    /// table id matches `producer_table_id`.
    async fn verify_bootstrap_id(&self, bootstrap_id: &str, producer_table_id: &str) -> bool;

    /// Best-effort: deletes a producer-side stream. Failures are not fatal
    /// to `DeleteUniverseReplication` (§4.7).
    async fn delete_stream(&self, stream_id: &str) -> bool;
}
