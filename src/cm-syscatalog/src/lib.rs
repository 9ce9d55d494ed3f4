//! The Sys-Catalog Store: a linearizable, Raft-replicated log of catalog
//! mutations, fenced by the current leader term (§4.1).
//!
//! This crate models the log itself, not the entities stored in it — those
//! live in `cm-catalog`. Callers submit opaque, already-serialized payloads
//! keyed by `(EntityKind, id)` (§9 "Tagged-variant entries"); this crate is
//! responsible only for commit/fencing/replay semantics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cm_types::LeaderTerm;
use thiserror::Error;
use tokio::sync::RwLock;

/// The closed set of entity kinds persisted in the sys-catalog (§9
/// "Tagged-variant entries"). Tablet servers are intentionally absent: per
/// §4.2, they are rebuilt from heartbeats, not from sys-catalog replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Namespace,
    Table,
    Tablet,
    ClusterConfig,
    Snapshot,
    CdcStream,
    UniverseReplication,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SysCatalogKey {
    pub kind: EntityKind,
    pub id: String,
}

impl SysCatalogKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

/// Failure semantics for a sys-catalog write (§4.1, §7): a network error or
/// not-leader error must leave no observable in-memory change in the caller.
#[derive(Debug, Error)]
pub enum SysCatalogError {
    #[error("no longer leader: write submitted at {submitted}, current term is {current}")]
    NoLongerLeader {
        submitted: LeaderTerm,
        current: LeaderTerm,
    },
    #[error("sys-catalog unavailable: {0}")]
    Unavailable(String),
    #[error("write aborted by the underlying replicated log: {0}")]
    Aborted(String),
    #[error("no entry for {0:?}/{1}")]
    NotFound(EntityKind, String),
}

/// A single persisted row: its key, the serialized payload, and the term
/// under which it was last written.
#[derive(Clone, Debug)]
pub struct SysCatalogRow {
    pub key: SysCatalogKey,
    pub payload: serde_json::Value,
    pub term: LeaderTerm,
}

/// The Sys-Catalog Store contract (§4.1).
///
/// Every write is fenced by `term`: it commits only if `term` equals the
/// store's current leader term at apply time. This prevents split-brain
/// mutations from a leader that has since lost an election (§5, §7).
#[async_trait]
pub trait SysCatalogStore: Send + Sync {
    async fn add_item(
        &self,
        key: SysCatalogKey,
        payload: serde_json::Value,
        term: LeaderTerm,
    ) -> Result<(), SysCatalogError>;

    async fn update_item(
        &self,
        key: SysCatalogKey,
        payload: serde_json::Value,
        term: LeaderTerm,
    ) -> Result<(), SysCatalogError>;

    async fn delete_item(&self, key: SysCatalogKey, term: LeaderTerm) -> Result<(), SysCatalogError>;

    /// Replays all persisted entities of `kind`, in no particular order,
    /// calling `visitor` with each `(id, payload)` pair. Used on leadership
    /// acquisition to rebuild in-memory state (§4.2).
    async fn visit(
        &self,
        kind: EntityKind,
        visitor: &mut (dyn FnMut(String, serde_json::Value) + Send),
    ) -> Result<(), SysCatalogError>;

    /// The term this store currently fences writes against.
    fn current_term(&self) -> LeaderTerm;
}

/// An in-memory stand-in for the Raft-replicated log, sufficient to exercise
/// the catalog manager's locking discipline and fencing semantics in tests.
/// A production build would replace this with a client of the tablet
/// replication layer (explicitly out of scope, §1).
pub struct InMemorySysCatalog {
    rows: RwLock<BTreeMap<SysCatalogKey, SysCatalogRow>>,
    term: AtomicU64,
}

impl InMemorySysCatalog {
    pub fn new(term: LeaderTerm) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            term: AtomicU64::new(term.0),
        }
    }

    /// Simulates a leadership change: bumps the fencing term so that any
    /// in-flight write from the old leader is rejected (§5, §7).
    pub fn force_new_term(&self) -> LeaderTerm {
        let new_term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        LeaderTerm(new_term)
    }

    fn check_term(&self, term: LeaderTerm) -> Result<(), SysCatalogError> {
        let current = LeaderTerm(self.term.load(Ordering::SeqCst));
        if term != current {
            return Err(SysCatalogError::NoLongerLeader {
                submitted: term,
                current,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SysCatalogStore for InMemorySysCatalog {
    async fn add_item(
        &self,
        key: SysCatalogKey,
        payload: serde_json::Value,
        term: LeaderTerm,
    ) -> Result<(), SysCatalogError> {
        self.check_term(term)?;
        let mut rows = self.rows.write().await;
        rows.insert(
            key.clone(),
            SysCatalogRow {
                key,
                payload,
                term,
            },
        );
        Ok(())
    }

    async fn update_item(
        &self,
        key: SysCatalogKey,
        payload: serde_json::Value,
        term: LeaderTerm,
    ) -> Result<(), SysCatalogError> {
        self.check_term(term)?;
        let mut rows = self.rows.write().await;
        if !rows.contains_key(&key) {
            return Err(SysCatalogError::NotFound(key.kind, key.id));
        }
        rows.insert(
            key.clone(),
            SysCatalogRow {
                key,
                payload,
                term,
            },
        );
        Ok(())
    }

    async fn delete_item(&self, key: SysCatalogKey, term: LeaderTerm) -> Result<(), SysCatalogError> {
        self.check_term(term)?;
        let mut rows = self.rows.write().await;
        rows.remove(&key)
            .map(|_| ())
            .ok_or_else(|| SysCatalogError::NotFound(key.kind, key.id))
    }

    async fn visit(
        &self,
        kind: EntityKind,
        visitor: &mut (dyn FnMut(String, serde_json::Value) + Send),
    ) -> Result<(), SysCatalogError> {
        let rows = self.rows.read().await;
        for row in rows.values().filter(|r| r.key.kind == kind) {
            visitor(row.key.id.clone(), row.payload.clone());
        }
        Ok(())
    }

    fn current_term(&self) -> LeaderTerm {
        LeaderTerm(self.term.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_under_stale_term_is_rejected() {
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let key = SysCatalogKey::new(EntityKind::Namespace, "ns-1");
        store
            .add_item(key.clone(), json!({"name": "a"}), LeaderTerm(1))
            .await
            .unwrap();

        store.force_new_term();

        let err = store
            .update_item(key, json!({"name": "b"}), LeaderTerm(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SysCatalogError::NoLongerLeader { .. }));
    }

    #[tokio::test]
    async fn visit_replays_all_rows_of_a_kind() {
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        for i in 0..3 {
            store
                .add_item(
                    SysCatalogKey::new(EntityKind::Table, format!("t{i}")),
                    json!({"n": i}),
                    LeaderTerm(1),
                )
                .await
                .unwrap();
        }
        store
            .add_item(
                SysCatalogKey::new(EntityKind::Namespace, "ns"),
                json!({}),
                LeaderTerm(1),
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        store
            .visit(EntityKind::Table, &mut |id, _payload| seen.push(id))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["t0".to_string(), "t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn delete_missing_entry_fails() {
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let err = store
            .delete_item(
                SysCatalogKey::new(EntityKind::Snapshot, "missing"),
                LeaderTerm(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SysCatalogError::NotFound(..)));
    }
}
