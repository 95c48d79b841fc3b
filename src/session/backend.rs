//! Backend-side statement handle table

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::BackendHandle;
use crate::ids::{BackendStmtId, GlobalStmtId};
use crate::registry::{RegistryResult, StmtCatalog};

/// Maps proxy-global ids to the physical statements prepared on one
/// backend connection.
///
/// Backend ids are assigned by the server and are only meaningful for this
/// connection's lifetime; the proxy never recycles them. Dropping the
/// table releases the server reference counts and closes every handle
/// (each handle closes its physical statement when dropped).
pub struct BackendStmtTable {
    catalog: Arc<StmtCatalog>,
    backend_to_global: HashMap<BackendStmtId, GlobalStmtId>,
    global_to_backend: HashMap<GlobalStmtId, BackendStmtId>,
    global_to_handle: HashMap<GlobalStmtId, BackendHandle>,
}

impl BackendStmtTable {
    pub fn new(catalog: Arc<StmtCatalog>) -> Self {
        BackendStmtTable {
            catalog,
            backend_to_global: HashMap::new(),
            global_to_backend: HashMap::new(),
            global_to_handle: HashMap::new(),
        }
    }

    /// Record a freshly prepared physical statement.
    ///
    /// Binds the statement in both directions, takes ownership of the
    /// handle, and adds one server reference to the catalog entry.
    /// Re-inserting for a global id this connection already has replaces
    /// the binding (closing the displaced handle) without double-counting
    /// the reference. A backend id the server has recycled for a
    /// different statement evicts the stale binding first, so lookups can
    /// never route an EXECUTE to a statement the server no longer holds
    /// under that id.
    pub fn insert(
        &mut self,
        global_id: GlobalStmtId,
        backend_id: BackendStmtId,
        handle: BackendHandle,
    ) -> RegistryResult<()> {
        if let Some(old_global) = self.backend_to_global.get(&backend_id).copied() {
            if old_global != global_id {
                self.global_to_backend.remove(&old_global);
                self.global_to_handle.remove(&old_global);
                if let Err(e) = self.catalog.ref_server(old_global, -1) {
                    tracing::warn!(%old_global, %backend_id, error = %e,
                        "stale backend binding release failed");
                }
            }
        }
        if !self.global_to_backend.contains_key(&global_id) {
            self.catalog.ref_server(global_id, 1)?;
        }
        if let Some(old) = self.global_to_backend.insert(global_id, backend_id) {
            self.backend_to_global.remove(&old);
        }
        self.backend_to_global.insert(backend_id, global_id);
        self.global_to_handle.insert(global_id, handle);
        Ok(())
    }

    /// The physical handle for `global_id` on this connection, if the
    /// statement has been prepared here.
    pub fn find_backend_handle(&self, global_id: GlobalStmtId) -> Option<&BackendHandle> {
        self.global_to_handle.get(&global_id)
    }

    /// The server-assigned id for `global_id` on this connection.
    pub fn backend_id_for(&self, global_id: GlobalStmtId) -> Option<BackendStmtId> {
        self.global_to_backend.get(&global_id).copied()
    }

    /// Reverse lookup from a server-assigned id.
    pub fn find_global(&self, backend_id: BackendStmtId) -> Option<GlobalStmtId> {
        self.backend_to_global.get(&backend_id).copied()
    }

    /// Statements physically prepared on this connection.
    pub fn num_backend_stmts(&self) -> usize {
        self.backend_to_global.len()
    }
}

impl Drop for BackendStmtTable {
    /// Release the server reference for every binding; the handles close
    /// their physical statements as the map drops. Infallible: errors are
    /// logged and swallowed.
    fn drop(&mut self) {
        for &global_id in self.global_to_handle.keys() {
            if let Err(e) = self.catalog.ref_server(global_id, -1) {
                tracing::warn!(%global_id, error = %e,
                    "server binding release failed during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{BackendStmt, StmtDescriptor};
    use crate::registry::{QueryDigest, StmtProperties, StmtScope};

    #[derive(Debug)]
    struct FakeStmt(BackendStmtId);

    impl BackendStmt for FakeStmt {
        fn backend_id(&self) -> BackendStmtId {
            self.0
        }
    }

    fn handle(id: u32) -> BackendHandle {
        Box::new(FakeStmt(BackendStmtId::new(id)))
    }

    fn publish(catalog: &StmtCatalog, query: &str) -> GlobalStmtId {
        catalog
            .resolve_or_insert(
                &StmtScope::new(0, "u", "s"),
                query,
                &QueryDigest {
                    digest: 1,
                    text: query.to_string(),
                },
                StmtDescriptor {
                    num_columns: 1,
                    num_params: 0,
                    warning_count: 0,
                    fields: Vec::new(),
                },
                StmtProperties::default(),
            )
            .unwrap()
            .id
    }

    fn prepared_catalog() -> (Arc<StmtCatalog>, GlobalStmtId) {
        let catalog = Arc::new(StmtCatalog::new());
        let id = publish(&catalog, "SELECT 1");
        (catalog, id)
    }

    #[test]
    fn test_insert_binds_both_directions() {
        let (catalog, global) = prepared_catalog();
        let mut table = BackendStmtTable::new(catalog.clone());

        table.insert(global, BackendStmtId::new(7), handle(7)).unwrap();
        assert_eq!(table.backend_id_for(global), Some(BackendStmtId::new(7)));
        assert_eq!(table.find_global(BackendStmtId::new(7)), Some(global));
        assert!(table.find_backend_handle(global).is_some());
        assert_eq!(table.num_backend_stmts(), 1);
        assert_eq!(catalog.find_by_id(global).unwrap().ref_count_server, 1);
    }

    #[test]
    fn test_rebind_does_not_double_count() {
        let (catalog, global) = prepared_catalog();
        let mut table = BackendStmtTable::new(catalog.clone());

        table.insert(global, BackendStmtId::new(7), handle(7)).unwrap();
        table.insert(global, BackendStmtId::new(9), handle(9)).unwrap();

        assert_eq!(table.backend_id_for(global), Some(BackendStmtId::new(9)));
        assert_eq!(table.find_global(BackendStmtId::new(7)), None);
        assert_eq!(table.num_backend_stmts(), 1);
        assert_eq!(catalog.find_by_id(global).unwrap().ref_count_server, 1);
    }

    #[test]
    fn test_backend_id_reused_for_different_global() {
        let (catalog, first) = prepared_catalog();
        let second = publish(&catalog, "SELECT 2");
        let mut table = BackendStmtTable::new(catalog.clone());

        table.insert(first, BackendStmtId::new(7), handle(7)).unwrap();
        // the server closed the first statement and recycled id 7
        table.insert(second, BackendStmtId::new(7), handle(7)).unwrap();

        assert_eq!(table.find_global(BackendStmtId::new(7)), Some(second));
        assert_eq!(table.backend_id_for(first), None);
        assert!(table.find_backend_handle(first).is_none());
        assert_eq!(table.num_backend_stmts(), 1);
        assert_eq!(catalog.find_by_id(first).unwrap().ref_count_server, 0);
        assert_eq!(catalog.find_by_id(second).unwrap().ref_count_server, 1);
    }

    #[test]
    fn test_teardown_releases_server_refs() {
        let (catalog, global) = prepared_catalog();
        {
            let mut table = BackendStmtTable::new(catalog.clone());
            table.insert(global, BackendStmtId::new(7), handle(7)).unwrap();
            // drop the client reference; the server binding keeps the
            // entry alive until the table goes away
            catalog.ref_client(global, -1).unwrap();
            assert!(catalog.find_by_id(global).is_some());
        }
        assert!(catalog.find_by_id(global).is_none());
    }
}
