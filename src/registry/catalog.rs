//! Process-global statement catalog
//!
//! The catalog owns every [`StmtInfo`] in the proxy and is the only
//! component shared across worker threads. A single reader-writer lock
//! guards both indexes and all reference count mutations: lookups take it
//! in read mode, everything else in write mode. No I/O happens under the
//! lock and the catalog never calls into session structures, so the
//! session-then-catalog lock order can never deadlock.

use std::collections::HashMap;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use super::info::{fingerprint, QueryDigest, StmtInfo, StmtProperties, StmtScope};
use super::snapshot::StmtSnapshotRow;
use super::{RefSide, RegistryError, RegistryResult};
use crate::driver::StmtDescriptor;
use crate::ids::GlobalStmtId;

/// Fingerprint function the catalog hashes tuples with.
///
/// Injectable at construction so collision handling is testable with a
/// degenerate hash; production catalogs use [`fingerprint`].
pub type FingerprintFn = fn(&StmtScope, &str) -> u64;

/// Outcome of a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Proxy-global id for the statement
    pub id: GlobalStmtId,
    /// Whether a new catalog entry was published
    pub was_new: bool,
    /// Set when the resolve detected metadata drift: the previous entry
    /// was detached and clients still holding it must re-prepare
    pub replaced: Option<GlobalStmtId>,
}

/// Catalog-wide counters for the stats surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogMetrics {
    /// Statements with at least one client handle
    pub client_unique: u64,
    /// Total client handles across all statements
    pub client_total: u64,
    /// Highest global id allocated so far
    pub max_stmt_id: u64,
    /// Statements currently resident
    pub cached: u64,
    /// Statements with at least one backend binding
    pub server_unique: u64,
    /// Total backend bindings across all statements
    pub server_total: u64,
}

struct CatalogInner {
    by_id: HashMap<GlobalStmtId, StmtInfo>,
    /// Fingerprint to collision chain; element 0 is the earliest
    /// still-live entry published under that fingerprint.
    by_fingerprint: HashMap<u64, Vec<GlobalStmtId>>,
    /// Retired ids awaiting reuse, LIFO
    free_ids: Vec<GlobalStmtId>,
    next_id: u64,
}

impl CatalogInner {
    /// Walk the collision chain for `fp` and return the entry whose full
    /// tuple matches.
    fn find_matching(&self, fp: u64, scope: &StmtScope, query: &str) -> Option<GlobalStmtId> {
        let chain = self.by_fingerprint.get(&fp)?;
        chain.iter().copied().find(|id| {
            self.by_id
                .get(id)
                .is_some_and(|info| info.matches(scope, query))
        })
    }

    fn alloc_id(&mut self) -> RegistryResult<GlobalStmtId> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        if self.next_id == u64::MAX {
            return Err(RegistryError::CatalogExhausted);
        }
        let id = GlobalStmtId::new(self.next_id);
        self.next_id += 1;
        Ok(id)
    }

    /// Remove `id` from its fingerprint chain so new resolves can no
    /// longer find it; the entry itself keeps draining through its
    /// reference counts.
    fn detach_from_chain(&mut self, fp: u64, id: GlobalStmtId) {
        if let Some(chain) = self.by_fingerprint.get_mut(&fp) {
            chain.retain(|&c| c != id);
            if chain.is_empty() {
                self.by_fingerprint.remove(&fp);
            }
        }
    }

    /// Drop a fully released entry and recycle its id.
    fn retire(&mut self, id: GlobalStmtId) {
        if let Some(info) = self.by_id.remove(&id) {
            self.detach_from_chain(info.fingerprint, id);
            self.free_ids.push(id);
            tracing::debug!(%id, "retired prepared statement");
        }
    }
}

/// Process-global catalog of prepared statement metadata.
///
/// Sessions hold [`GlobalStmtId`]s and borrow metadata through read
/// guards; the catalog keeps sole ownership of every entry. An entry stays
/// resident exactly as long as either reference count is non-zero.
pub struct StmtCatalog {
    inner: RwLock<CatalogInner>,
    hasher: FingerprintFn,
}

impl StmtCatalog {
    pub fn new() -> Self {
        Self::with_hasher(fingerprint)
    }

    /// Catalog with a caller-supplied fingerprint function.
    pub fn with_hasher(hasher: FingerprintFn) -> Self {
        StmtCatalog {
            inner: RwLock::new(CatalogInner {
                by_id: HashMap::new(),
                by_fingerprint: HashMap::new(),
                free_ids: Vec::new(),
                // start at 1 so 0 can mean "no statement"
                next_id: 1,
            }),
            hasher,
        }
    }

    /// The fingerprint this catalog computes for a tuple.
    pub fn fingerprint_of(&self, scope: &StmtScope, query: &str) -> u64 {
        (self.hasher)(scope, query)
    }

    /// Resolve a statement to its global id, publishing it if absent.
    ///
    /// On a hit the client reference count is incremented on behalf of the
    /// handle the caller is about to mint; on a miss a new entry is
    /// published carrying one client reference. A hit whose stored column
    /// or parameter counts disagree with `descriptor` is metadata drift:
    /// the stale entry is detached, a replacement is published under a
    /// fresh id, and the detached id is reported in
    /// [`Resolved::replaced`].
    pub fn resolve_or_insert(
        &self,
        scope: &StmtScope,
        query: &str,
        digest: &QueryDigest,
        descriptor: StmtDescriptor,
        properties: StmtProperties,
    ) -> RegistryResult<Resolved> {
        let fp = (self.hasher)(scope, query);
        let mut inner = self.inner.write();

        let mut replaced = None;
        if let Some(id) = inner.find_matching(fp, scope, query) {
            if let Some(info) = inner.by_id.get_mut(&id) {
                if info.num_columns == descriptor.num_columns
                    && info.num_params == descriptor.num_params
                {
                    info.ref_count_client += 1;
                    return Ok(Resolved {
                        id,
                        was_new: false,
                        replaced: None,
                    });
                }
            }
            // Metadata drifted on the backend (schema change between
            // prepares). Detach the stale entry and publish a replacement.
            inner.detach_from_chain(fp, id);
            tracing::warn!(old = %id, "statement metadata drift (fingerprint {fp:#018x}), re-prepare required");
            replaced = Some(id);
        }

        let id = inner.alloc_id()?;
        let info = StmtInfo::new(id, fp, scope, query, digest, descriptor, properties);
        inner.by_id.insert(id, info);
        inner.by_fingerprint.entry(fp).or_default().push(id);
        tracing::debug!(%id, "published prepared statement");
        Ok(Resolved {
            id,
            was_new: true,
            replaced,
        })
    }

    /// Fast path for a PREPARE that may be served from the cache without a
    /// backend round-trip. Increments the client reference count on a hit,
    /// exactly like a hit in [`resolve_or_insert`](Self::resolve_or_insert).
    pub fn resolve_cached(&self, scope: &StmtScope, query: &str) -> Option<Resolved> {
        let fp = (self.hasher)(scope, query);
        let mut inner = self.inner.write();
        let id = inner.find_matching(fp, scope, query)?;
        let info = inner.by_id.get_mut(&id)?;
        info.ref_count_client += 1;
        Some(Resolved {
            id,
            was_new: false,
            replaced: None,
        })
    }

    /// Tuple-equality lookup without reserving a reference.
    pub fn lookup(&self, scope: &StmtScope, query: &str) -> Option<GlobalStmtId> {
        let fp = (self.hasher)(scope, query);
        let inner = self.inner.read();
        inner.find_matching(fp, scope, query)
    }

    /// Borrowed read-only view of a statement's metadata.
    ///
    /// The guard holds the catalog's read lock; drop it before calling any
    /// mutating catalog operation from the same thread.
    pub fn find_by_id(&self, id: GlobalStmtId) -> Option<MappedRwLockReadGuard<'_, StmtInfo>> {
        RwLockReadGuard::try_map(self.inner.read(), |inner| inner.by_id.get(&id)).ok()
    }

    /// Fingerprint lookup resolving to the head of the collision chain
    /// (the earliest live entry published under `fp`).
    pub fn find_by_fingerprint(&self, fp: u64) -> Option<MappedRwLockReadGuard<'_, StmtInfo>> {
        RwLockReadGuard::try_map(self.inner.read(), |inner| {
            inner
                .by_fingerprint
                .get(&fp)
                .and_then(|chain| chain.first())
                .and_then(|id| inner.by_id.get(id))
        })
        .ok()
    }

    /// Check a lazily re-prepared statement's metadata against the stored
    /// entry.
    ///
    /// Matching counts refresh the stored warning count. Diverging counts
    /// detach the entry from its fingerprint chain and report drift; the
    /// wire layer turns that into a "re-prepare required" error for the
    /// client.
    pub fn verify_metadata(
        &self,
        id: GlobalStmtId,
        descriptor: &StmtDescriptor,
    ) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        let info = inner
            .by_id
            .get_mut(&id)
            .ok_or(RegistryError::UnknownGlobalStmt(id))?;
        if info.num_columns == descriptor.num_columns && info.num_params == descriptor.num_params {
            info.warning_count = descriptor.warning_count;
            return Ok(());
        }
        let fp = info.fingerprint;
        inner.detach_from_chain(fp, id);
        tracing::warn!(%id, "statement metadata drift on re-prepare");
        Err(RegistryError::FingerprintDrift {
            id,
            fingerprint: fp,
        })
    }

    /// Adjust the client-side reference count by `delta` (signed).
    ///
    /// When both counts reach zero the entry is retired and its id
    /// returns to the free pool.
    pub fn ref_client(&self, id: GlobalStmtId, delta: i32) -> RegistryResult<()> {
        self.adjust_ref(id, delta, RefSide::Client)
    }

    /// Adjust the server-side reference count by `delta` (signed).
    pub fn ref_server(&self, id: GlobalStmtId, delta: i32) -> RegistryResult<()> {
        self.adjust_ref(id, delta, RefSide::Server)
    }

    fn adjust_ref(&self, id: GlobalStmtId, delta: i32, side: RefSide) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        let info = inner
            .by_id
            .get_mut(&id)
            .ok_or(RegistryError::UnknownGlobalStmt(id))?;
        let fully_released = {
            let count = match side {
                RefSide::Client => &mut info.ref_count_client,
                RefSide::Server => &mut info.ref_count_server,
            };
            let next = *count + delta;
            if next < 0 {
                tracing::error!(%id, %side, delta, "reference count underflow");
                return Err(RegistryError::RefCountUnderflow { id, side });
            }
            *count = next;
            info.ref_count_client == 0 && info.ref_count_server == 0
        };
        if fully_released {
            inner.retire(id);
        }
        Ok(())
    }

    /// Catalog-wide counters.
    pub fn metrics(&self) -> CatalogMetrics {
        let inner = self.inner.read();
        let mut m = CatalogMetrics {
            max_stmt_id: inner.next_id - 1,
            cached: inner.by_id.len() as u64,
            ..CatalogMetrics::default()
        };
        for info in inner.by_id.values() {
            if info.ref_count_client > 0 {
                m.client_unique += 1;
                m.client_total += info.ref_count_client as u64;
            }
            if info.ref_count_server > 0 {
                m.server_unique += 1;
                m.server_total += info.ref_count_server as u64;
            }
        }
        m
    }

    /// Tabular view of every resident statement for the admin interface,
    /// ordered by global id.
    pub fn snapshot(&self) -> Vec<StmtSnapshotRow> {
        let inner = self.inner.read();
        let mut rows: Vec<(GlobalStmtId, StmtSnapshotRow)> = inner
            .by_id
            .iter()
            .map(|(id, info)| (*id, StmtSnapshotRow::from_info(info)))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Number of resident statements.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn set_next_id_for_test(&self, next: u64) {
        self.inner.write().next_id = next;
    }
}

impl Default for StmtCatalog {
    fn default() -> Self {
        Self::new()
    }
}
