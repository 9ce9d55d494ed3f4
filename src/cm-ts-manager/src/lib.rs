//! The Tablet Server Manager (§4.3): the set of known tablet servers, their
//! liveness, and the load counters the balancer reads.
//!
//! Tablet servers are never persisted through the sys-catalog (§4.2): they
//! are rebuilt purely from heartbeats, so a master restart relies on
//! `TSHeartbeat` RPCs to repopulate this manager rather than on replay.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cm_types::TsId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// An injectable source of "now", so liveness windows are testable without
/// sleeping real wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose reading can be advanced deterministically; used in tests.
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, d: Duration) {
        self.offset_ms.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Identifies a particular process incarnation of a tablet server: the
/// permanent uuid survives restarts, the instance sequence number does not
/// (§4.3 `Register`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsInstance {
    pub permanent_uuid: TsId,
    pub instance_seqno: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registration {
    pub rpc_addresses: Vec<String>,
    pub cloud: String,
    pub region: String,
    pub zone: String,
    pub placement_uuid: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoadCounters {
    pub num_tablets: u32,
    pub num_leaders: u32,
}

#[derive(Clone, Debug)]
pub struct TsDescriptor {
    pub instance: TsInstance,
    pub registration: Registration,
    pub last_heartbeat: Instant,
    pub reported_tablets: std::collections::BTreeSet<cm_types::TabletId>,
    pub has_reported_all_tablets: bool,
    pub load: LoadCounters,
}

#[derive(Debug, Error)]
pub enum TsManagerError {
    #[error("tablet server {0} not found")]
    NotFound(TsId),
    #[error("tablet server {uuid} instance mismatch: have seqno {have}, requested {requested}")]
    InstanceMismatch {
        uuid: TsId,
        have: u64,
        requested: u64,
    },
}

/// The Tablet Server Manager (§4.3).
pub struct TsManager {
    clock: Arc<dyn Clock>,
    liveness_window: Duration,
    servers: RwLock<BTreeMap<TsId, TsDescriptor>>,
}

impl TsManager {
    pub fn new(clock: Arc<dyn Clock>, liveness_window: Duration) -> Self {
        Self {
            clock,
            liveness_window,
            servers: RwLock::new(BTreeMap::new()),
        }
    }

    /// On first contact, or after the instance-uuid's sequence number
    /// advances, create/replace the descriptor. If the same permanent uuid
    /// re-registers with a newer instance id, the previous descriptor is
    /// superseded (§4.3).
    pub async fn register(&self, instance: TsInstance, registration: Registration) {
        let mut servers = self.servers.write().await;
        let now = self.clock.now();
        match servers.get(&instance.permanent_uuid) {
            Some(existing) if existing.instance.instance_seqno > instance.instance_seqno => {
                info!(
                    uuid = %instance.permanent_uuid,
                    "ignoring registration from a stale (lower seqno) instance"
                );
                return;
            }
            _ => {}
        }
        servers.insert(
            instance.permanent_uuid.clone(),
            TsDescriptor {
                instance,
                registration,
                last_heartbeat: now,
                reported_tablets: Default::default(),
                has_reported_all_tablets: false,
                load: LoadCounters::default(),
            },
        );
    }

    /// Records a heartbeat for an already-registered instance, optionally
    /// updating its reported tablet set and load counters.
    pub async fn record_heartbeat(
        &self,
        instance: &TsInstance,
        reported_tablets: Option<std::collections::BTreeSet<cm_types::TabletId>>,
    ) -> Result<(), TsManagerError> {
        let mut servers = self.servers.write().await;
        let desc = servers
            .get_mut(&instance.permanent_uuid)
            .ok_or_else(|| TsManagerError::NotFound(instance.permanent_uuid.clone()))?;
        if desc.instance.instance_seqno != instance.instance_seqno {
            return Err(TsManagerError::InstanceMismatch {
                uuid: instance.permanent_uuid.clone(),
                have: desc.instance.instance_seqno,
                requested: instance.instance_seqno,
            });
        }
        desc.last_heartbeat = self.clock.now();
        if let Some(tablets) = reported_tablets {
            desc.load.num_tablets = tablets.len() as u32;
            desc.reported_tablets = tablets;
            desc.has_reported_all_tablets = true;
        }
        Ok(())
    }

    /// Fails with `NotFound` if no matching uuid or instance mismatch
    /// (§4.3 `LookupTS`).
    pub async fn lookup(&self, instance: &TsInstance) -> Result<TsDescriptor, TsManagerError> {
        let servers = self.servers.read().await;
        let desc = servers
            .get(&instance.permanent_uuid)
            .ok_or_else(|| TsManagerError::NotFound(instance.permanent_uuid.clone()))?;
        if desc.instance.instance_seqno != instance.instance_seqno {
            return Err(TsManagerError::InstanceMismatch {
                uuid: instance.permanent_uuid.clone(),
                have: desc.instance.instance_seqno,
                requested: instance.instance_seqno,
            });
        }
        Ok(desc.clone())
    }

    fn is_live(&self, desc: &TsDescriptor, now: Instant) -> bool {
        now.saturating_duration_since(desc.last_heartbeat) <= self.liveness_window
    }

    /// Returns descriptors heartbeated within the liveness window and
    /// matching `placement_uuid` (an empty placement uuid matches servers
    /// with an empty placement uuid) (§4.3 `GetAllLive`).
    pub async fn get_all_live(&self, placement_uuid: &str) -> Vec<TsDescriptor> {
        let servers = self.servers.read().await;
        let now = self.clock.now();
        servers
            .values()
            .filter(|d| self.is_live(d, now))
            .filter(|d| d.registration.placement_uuid == placement_uuid)
            .cloned()
            .collect()
    }

    /// Stricter than `get_all_live`: live servers that have reported their
    /// full tablet set at least once (§4.3 `GetAllReported`).
    pub async fn get_all_reported(&self, placement_uuid: &str) -> Vec<TsDescriptor> {
        self.get_all_live(placement_uuid)
            .await
            .into_iter()
            .filter(|d| d.has_reported_all_tablets)
            .collect()
    }

    pub async fn all(&self) -> Vec<TsDescriptor> {
        self.servers.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(uuid: &str, seqno: u64) -> TsInstance {
        TsInstance {
            permanent_uuid: TsId(uuid.to_string()),
            instance_seqno: seqno,
        }
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock, Duration::from_secs(10));
        let inst = instance("ts-1", 1);
        mgr.register(inst.clone(), Registration::default()).await;
        let desc = mgr.lookup(&inst).await.unwrap();
        assert_eq!(desc.instance, inst);
    }

    #[tokio::test]
    async fn lookup_instance_mismatch_fails() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock, Duration::from_secs(10));
        mgr.register(instance("ts-1", 1), Registration::default()).await;
        let err = mgr.lookup(&instance("ts-1", 2)).await.unwrap_err();
        assert!(matches!(err, TsManagerError::InstanceMismatch { .. }));
    }

    #[tokio::test]
    async fn liveness_window_excludes_stale_heartbeats() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock.clone(), Duration::from_secs(5));
        mgr.register(instance("ts-1", 1), Registration::default()).await;

        assert_eq!(mgr.get_all_live("").await.len(), 1);
        clock.advance(Duration::from_secs(10));
        assert_eq!(mgr.get_all_live("").await.len(), 0);
    }

    #[tokio::test]
    async fn newer_instance_supersedes_older() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock, Duration::from_secs(10));
        mgr.register(instance("ts-1", 1), Registration::default()).await;
        mgr.register(
            instance("ts-1", 2),
            Registration {
                zone: "z2".into(),
                ..Default::default()
            },
        )
        .await;
        let desc = mgr.lookup(&instance("ts-1", 2)).await.unwrap();
        assert_eq!(desc.registration.zone, "z2");
    }

    #[tokio::test]
    async fn stale_registration_is_ignored() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock, Duration::from_secs(10));
        mgr.register(instance("ts-1", 5), Registration::default()).await;
        mgr.register(
            instance("ts-1", 2),
            Registration {
                zone: "stale".into(),
                ..Default::default()
            },
        )
        .await;
        let desc = mgr.lookup(&instance("ts-1", 5)).await.unwrap();
        assert_ne!(desc.registration.zone, "stale");
    }

    #[tokio::test]
    async fn get_all_reported_requires_a_full_tablet_report() {
        let clock = Arc::new(ManualClock::default());
        let mgr = TsManager::new(clock, Duration::from_secs(10));
        let inst = instance("ts-1", 1);
        mgr.register(inst.clone(), Registration::default()).await;
        assert_eq!(mgr.get_all_reported("").await.len(), 0);
        mgr.record_heartbeat(&inst, Some(Default::default())).await.unwrap();
        assert_eq!(mgr.get_all_reported("").await.len(), 1);
    }
}
