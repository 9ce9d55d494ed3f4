//! XCluster safe-time recomputation (§4.8, §9 "Clock-skew dependence").
//!
//! The safe-time table itself is data-plane state, not a Sys-Catalog
//! entity — it is rebuilt from live readings the same way `cm-ts-manager`
//! treats tablet-server registrations as observed rather than replayed.

use std::collections::BTreeMap;

use cm_catalog::EntityRegistry;
use cm_types::{HybridTime, NamespaceId, UniverseId};
use tokio::sync::Mutex;

use crate::traits::SafeTimeSource;

#[derive(Default)]
struct SafeTimeTableState {
    /// One row per `(universe_id, producer_tablet_id)`, mirroring the
    /// persisted schema described in §6.
    rows: BTreeMap<(UniverseId, String), HybridTime>,
    /// Last recomputed minimum per namespace, kept to enforce monotonicity
    /// across leader failover.
    namespace_safe_time: BTreeMap<NamespaceId, HybridTime>,
}

pub struct SafeTimeReport {
    pub namespaces_recomputed: usize,
    pub stale_rows_removed: usize,
}

/// Owns the in-memory XCluster safe-time table and its last-known
/// per-namespace minimums.
pub struct SafeTimeService {
    state: Mutex<SafeTimeTableState>,
}

impl SafeTimeService {
    pub fn new() -> Self {
        Self { state: Mutex::new(SafeTimeTableState::default()) }
    }

    /// The most recently recomputed safe time for `namespace_id`, or `None`
    /// if no producer tablet in that namespace has ever reported one.
    pub async fn namespace_safe_time(&self, namespace_id: &NamespaceId) -> Option<HybridTime> {
        self.state.lock().await.namespace_safe_time.get(namespace_id).copied()
    }

    /// Recomputes every namespace's safe time from the current consumer
    /// registry and a fresh round of producer readings, then drops rows for
    /// producer tablets no longer present in the registry.
    pub async fn recompute(&self, registry: &EntityRegistry, source: &dyn SafeTimeSource) -> SafeTimeReport {
        let mut live_tablets: BTreeMap<(UniverseId, String), NamespaceId> = BTreeMap::new();

        let cluster_config = registry.cluster_config().read().await;
        for (producer_id, entry) in &cluster_config.consumer_registry.producer_universes {
            for map in entry.table_stream_maps.values() {
                let namespace_id = match registry.get_table(&map.consumer_table_id).await {
                    Ok(table) => table.read().await.namespace_id.clone(),
                    Err(_) => continue,
                };
                for producer_tablet_id in map.producer_tablet_to_consumer_tablet.keys() {
                    live_tablets.insert((producer_id.clone(), producer_tablet_id.clone()), namespace_id.clone());
                }
            }
        }
        drop(cluster_config);

        let mut readings = Vec::with_capacity(live_tablets.len());
        for key in live_tablets.keys() {
            let reading = source.producer_tablet_safe_time(&key.1).await;
            readings.push((key.clone(), reading));
        }
        let system_ceiling = source.system_namespace_safe_time().await;

        let mut state = self.state.lock().await;
        for (key, reading) in readings {
            if let Some(t) = reading {
                state.rows.insert(key, t);
            }
        }

        let mut by_namespace: BTreeMap<NamespaceId, Vec<HybridTime>> = BTreeMap::new();
        for (key, namespace_id) in &live_tablets {
            if let Some(t) = state.rows.get(key) {
                by_namespace.entry(namespace_id.clone()).or_default().push(*t);
            }
        }

        let mut namespaces_recomputed = 0;
        for (namespace_id, times) in by_namespace {
            let Some(raw_min) = times.into_iter().min() else { continue };
            let clamped = raw_min.min(system_ceiling);
            let previous = state.namespace_safe_time.get(&namespace_id).copied().unwrap_or(HybridTime::MIN);
            state.namespace_safe_time.insert(namespace_id, previous.max(clamped));
            namespaces_recomputed += 1;
        }

        let stale: Vec<_> = state.rows.keys().filter(|k| !live_tablets.contains_key(*k)).cloned().collect();
        for key in &stale {
            state.rows.remove(key);
        }

        SafeTimeReport { namespaces_recomputed, stale_rows_removed: stale.len() }
    }
}

impl Default for SafeTimeService {
    fn default() -> Self {
        Self::new()
    }
}
