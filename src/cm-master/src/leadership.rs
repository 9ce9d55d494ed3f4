//! `leader_ready_term_` (§9 "Global mutable leader state"): the term up to
//! which this process has finished replaying the sys-catalog and resuming
//! in-flight operations. RPC handlers consult this before touching the
//! registry so a freshly-elected leader never serves a request against
//! state it hasn't finished rebuilding (§4.2, §8 scenario F).

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use cm_catalog::EntityRegistry;
use cm_snapshot::SnapshotOrchestrator;
use cm_syscatalog::SysCatalogStore;
use cm_types::LeaderTerm;
use tracing::{info, instrument};

use crate::error::MasterError;

/// `-1` means "not yet ready under any term"; `LeaderTerm` itself starts at
/// 0, so this is kept as a signed counter rather than reusing the newtype.
pub struct LeaderReadyState {
    ready_term: AtomicI64,
}

impl Default for LeaderReadyState {
    fn default() -> Self {
        Self {
            ready_term: AtomicI64::new(-1),
        }
    }
}

impl LeaderReadyState {
    /// Replays the sys-catalog into `registry` and resumes any in-flight
    /// snapshot operation, then marks `term` ready (§4.2, §4.6 `Resume`).
    #[instrument(skip(self, registry, store, snapshots))]
    pub async fn become_leader(
        &self,
        registry: &EntityRegistry,
        store: &dyn SysCatalogStore,
        snapshots: &SnapshotOrchestrator,
        term: LeaderTerm,
    ) -> Result<(), MasterError> {
        registry.reload_from_sys_catalog(store).await?;
        snapshots.resume_pending(store, term).await?;
        self.ready_term.store(term.0 as i64, Ordering::SeqCst);
        info!(term = term.0, "leadership replay complete");
        Ok(())
    }

    /// Clears readiness; called when this process learns it has lost
    /// leadership (§7 "leadership loss").
    pub fn step_down(&self) {
        self.ready_term.store(-1, Ordering::SeqCst);
    }

    pub fn is_ready_for(&self, term: LeaderTerm) -> bool {
        self.ready_term.load(Ordering::SeqCst) == term.0 as i64
    }

    /// Guard used at the top of every RPC handler: fails closed if this
    /// process has not finished replay for the store's current term, so a
    /// freshly-elected leader never serves requests against
    /// partially-rebuilt state.
    pub fn require_ready(&self, store: &dyn SysCatalogStore) -> Result<(), MasterError> {
        let current = store.current_term();
        if self.is_ready_for(current) {
            Ok(())
        } else {
            Err(MasterError::NotLeader {
                submitted: current,
                current,
            })
        }
    }
}

pub type SharedLeaderReadyState = Arc<LeaderReadyState>;
