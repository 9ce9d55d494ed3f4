//! `TSHeartbeat` (§6): registers/renews a tablet server, and tells the
//! caller when it needs to refetch `cluster_config` or the universe-key
//! registry rather than pushing the full payload on every beat.

use std::collections::BTreeSet;
use std::sync::Arc;

use cm_catalog::{ClusterConfig, EntityRegistry};
use cm_ts_manager::{Registration, TsInstance, TsManager, TsManagerError};
use cm_types::TabletId;
use tokio::sync::Mutex;

/// Per-server bookkeeping of which universe-key registry version it has
/// already been sent, so `TSHeartbeat` only pushes it again after a rotation
/// (§6 `universe_key_registry`). Kept outside `TsManager` since it is a
/// concern of encryption rollout, not liveness.
#[derive(Default)]
pub struct EncryptionAckTracker {
    acked: Mutex<std::collections::BTreeMap<cm_types::TsId, u64>>,
}

impl EncryptionAckTracker {
    /// Returns true the first time a server is heartbeated for
    /// `registry_version`, or whenever that version has increased since the
    /// server's last ack; records the version as sent either way.
    pub async fn should_send(&self, ts_id: &cm_types::TsId, registry_version: u64) -> bool {
        let mut acked = self.acked.lock().await;
        let needs_send = match acked.get(ts_id) {
            Some(&last) => last < registry_version,
            None => true,
        };
        acked.insert(ts_id.clone(), registry_version);
        needs_send
    }

    pub async fn forget(&self, ts_id: &cm_types::TsId) {
        self.acked.lock().await.remove(ts_id);
    }
}

pub struct HeartbeatRequest {
    pub instance: TsInstance,
    pub registration: Option<Registration>,
    pub reported_tablets: Option<BTreeSet<TabletId>>,
    pub cluster_config_version: u64,
}

pub struct HeartbeatResponse {
    /// Present when the caller's reported version is stale.
    pub consumer_registry: Option<cm_catalog::ConsumerRegistry>,
    /// Present when encryption is enabled and this server has not yet been
    /// sent the current registry version.
    pub universe_key_registry_version: Option<u64>,
}

/// §4.3 `Register`/`Heartbeat` plus the §6 cluster-config and
/// universe-key-registry push-on-change logic. Registration happens on
/// first contact (no prior descriptor); every later beat is a
/// `record_heartbeat`.
pub async fn handle_heartbeat(
    ts_manager: &TsManager,
    registry: &EntityRegistry,
    encryption_acks: &EncryptionAckTracker,
    request: HeartbeatRequest,
) -> Result<HeartbeatResponse, TsManagerError> {
    let known = ts_manager.lookup(&request.instance).await.is_ok();
    if !known {
        ts_manager
            .register(request.instance.clone(), request.registration.clone().unwrap_or_default())
            .await;
    } else {
        ts_manager
            .record_heartbeat(&request.instance, request.reported_tablets)
            .await?;
    }

    let config: Arc<ClusterConfig> = registry.cluster_config().read().await;

    let consumer_registry = if request.cluster_config_version < config.version {
        Some(config.consumer_registry.clone())
    } else {
        None
    };

    let universe_key_registry_version = if config.encryption_info.enabled
        && encryption_acks
            .should_send(&request.instance.permanent_uuid, config.encryption_info.universe_key_registry_version)
            .await
    {
        Some(config.encryption_info.universe_key_registry_version)
    } else {
        None
    };

    Ok(HeartbeatResponse {
        consumer_registry,
        universe_key_registry_version,
    })
}
