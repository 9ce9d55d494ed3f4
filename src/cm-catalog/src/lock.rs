//! The two-phase "locked write" protocol every entity mutation must follow
//! (§3 "Entity locking discipline", §9 "Two-phase mutation").
//!
//! This replaces the source system's RAII-scope-guard idiom with an
//! explicit commit-or-rollback object: callers acquire a [`DirtyGuard`],
//! mutate it in place, persist it through the sys-catalog, and only then
//! call [`DirtyGuard::commit`]. Dropping the guard without committing
//! discards the dirty copy and leaves committed state untouched — exactly
//! the "on failure, discard the dirty state" behavior the spec requires.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};

/// An entity protected by the locking discipline: a committed, readable
/// copy, and a single-writer mutation critical section (§5 "Each entity's
/// internal lock is a single-writer critical section").
pub struct LockedEntity<E> {
    committed: RwLock<Arc<E>>,
    mutation_lock: Mutex<()>,
}

impl<E: Clone> LockedEntity<E> {
    pub fn new(initial: E) -> Self {
        Self {
            committed: RwLock::new(Arc::new(initial)),
            mutation_lock: Mutex::new(()),
        }
    }

    /// Reads acquire a read lock and observe only committed state — a
    /// snapshot consistent with the last successful persistence, even if a
    /// mutation is concurrently in flight (§3).
    pub async fn read(&self) -> Arc<E> {
        self.committed.read().await.clone()
    }

    /// Step 1 of the locking discipline: acquire the entity's write lock and
    /// produce a mutable dirty copy of its committed state.
    pub async fn begin_mutation(&self) -> DirtyGuard<'_, E> {
        let guard = self.mutation_lock.lock().await;
        let dirty = (*self.committed.read().await).as_ref().clone();
        DirtyGuard {
            parent: self,
            _guard: guard,
            dirty,
        }
    }
}

/// The in-flight mutable copy produced by [`LockedEntity::begin_mutation`].
/// Mutate `dirty` directly (step 2), persist it through the sys-catalog
/// (step 3), and call [`Self::commit`] only on a successful persist (step
/// 4). If this guard is dropped without committing, the dirty copy is
/// discarded and the lock is released with no visible effect — the
/// required rollback-on-failure behavior.
pub struct DirtyGuard<'a, E> {
    parent: &'a LockedEntity<E>,
    _guard: MutexGuard<'a, ()>,
    pub dirty: E,
}

impl<'a, E: Clone> DirtyGuard<'a, E> {
    /// Step 4: atomically swap the committed state with the dirty state and
    /// release the lock (the guard is consumed).
    pub async fn commit(self) {
        let mut committed = self.parent.committed.write().await;
        *committed = Arc::new(self.dirty);
    }
}
