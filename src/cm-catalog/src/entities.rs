//! The entity structs of §3. Back-references (tablet → table, replica →
//! tablet server) are modeled as plain id lookups, never owning pointers
//! (§9 "Cyclic / back-references"): a dangling lookup returns `NotFound`,
//! which callers already know how to handle.

use std::collections::BTreeMap;

use cm_types::{
    CdcStreamState, HybridTime, MemberType, NamespaceId, NamespaceState, ReplicaRole,
    ReplicationInfo, SnapshotId, SnapshotState, StreamId, TableId, TabletId,
    TabletSnapshotState, TabletState, TableState, TsId, UniverseId, UniverseReplicationState,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceKind {
    Sql,
    NoSql,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    pub name: String,
    pub kind: NamespaceKind,
    pub state: NamespaceState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSchemaKind {
    #[default]
    Hash,
    Range,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub kind: PartitionSchemaKind,
    pub num_tablets: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: i32,
    pub name: String,
    pub type_name: String,
    pub is_key: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexInfo {
    pub indexed_table_id: Option<TableId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub namespace_id: NamespaceId,
    pub schema: TableSchema,
    pub partition_schema: PartitionSchema,
    pub replication_info: Option<ReplicationInfo>,
    pub index_info: Option<IndexInfo>,
    pub state: TableState,
    pub wal_retention_secs: u64,
}

/// A contiguous key range, half-open on the high end (§3).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Partition {
    /// `end_key` empty means "no upper bound"; `start_key` empty means "no
    /// lower bound" — the usual convention for a partitioned key space.
    pub fn contains_lower_bound_of(&self, other: &Partition) -> bool {
        self.end_key.is_empty() || other.start_key < self.end_key
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaPeerState {
    Bootstrapping,
    Running,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaLocation {
    pub role: ReplicaRole,
    pub member_type: MemberType,
    pub state: ReplicaPeerState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusState {
    pub current_term: u64,
    pub leader: Option<TsId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub table_id: TableId,
    pub partition: Partition,
    pub committed_consensus_state: ConsensusState,
    pub replica_locations: BTreeMap<TsId, ReplicaLocation>,
    pub state: TabletState,
}

impl Tablet {
    pub fn num_replicas(&self) -> usize {
        self.replica_locations.len()
    }

    pub fn num_running_voters(&self) -> usize {
        self.replica_locations
            .values()
            .filter(|r| r.member_type == MemberType::Voter && r.state == ReplicaPeerState::Running)
            .count()
    }

    pub fn leader(&self) -> Option<&TsId> {
        self.committed_consensus_state.leader.as_ref()
    }
}

/// A tagged-union snapshot entry (§9 "Tagged-variant entries"). Dispatch over
/// the variants must be total: any new tag requires a match arm everywhere
/// entries are processed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotEntry {
    Namespace {
        id: NamespaceId,
        metadata: serde_json::Value,
    },
    Table {
        id: TableId,
        metadata: serde_json::Value,
    },
    Tablet {
        id: TabletId,
        table_id: TableId,
        partition: Partition,
        metadata: serde_json::Value,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub state: SnapshotState,
    pub entries: Vec<SnapshotEntry>,
    pub tablet_states: BTreeMap<TabletId, TabletSnapshotState>,
}

impl Snapshot {
    pub fn all_tablets_complete(&self) -> bool {
        self.tablet_states
            .values()
            .all(|s| matches!(s, TabletSnapshotState::Complete))
    }

    pub fn any_tablet_failed(&self) -> bool {
        self.tablet_states
            .values()
            .any(|s| matches!(s, TabletSnapshotState::Failed))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CdcStreamOptions {
    pub record_type: Option<String>,
    pub record_format: Option<String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdcStream {
    pub id: StreamId,
    pub table_id: TableId,
    pub options: CdcStreamOptions,
    pub state: CdcStreamState,
}

/// A resolved mapping from one producer-side tablet to the consumer-side
/// tablet that owns the overlapping partition, installed into the consumer
/// registry (§4.7 stage 4).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableStreamMap {
    pub stream_id: StreamId,
    pub consumer_table_id: TableId,
    pub producer_tablet_to_consumer_tablet: BTreeMap<String, TabletId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UniverseReplication {
    pub producer_id: UniverseId,
    pub producer_master_addresses: Vec<String>,
    /// Producer-side table ids, opaque to the consumer.
    pub tables: Vec<String>,
    /// producer table id -> consumer `TableId`, populated as schema
    /// validation succeeds for each table (§4.7 stage 2).
    pub validated_tables: BTreeMap<String, TableId>,
    /// producer table id -> stream id on the producer (§4.7 stage 3).
    pub table_streams: BTreeMap<String, StreamId>,
    pub state: UniverseReplicationState,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub enabled: bool,
    pub universe_key_registry_version: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProducerRegistryEntry {
    pub disable_stream: bool,
    pub producer_master_addresses: Vec<String>,
    pub table_stream_maps: BTreeMap<String, TableStreamMap>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsumerRegistry {
    pub producer_universes: BTreeMap<UniverseId, ProducerRegistryEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    pub replication_info: Option<ReplicationInfo>,
    pub server_blacklist: Vec<TsId>,
    pub leader_blacklist: Vec<TsId>,
    pub encryption_info: EncryptionInfo,
    pub consumer_registry: ConsumerRegistry,
}

impl ClusterConfig {
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// Per-namespace XCluster safe-time, tracked outside the persisted entity
/// set (it is recomputed, not replayed) but exposed for tests of §8
/// property 4. Kept here because it shares the namespace id space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeTime {
    pub value: HybridTime,
}
