//! Client-side statement handle table

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::{ClientStmtId, GlobalStmtId};
use crate::registry::{RegistryError, RegistryResult, StmtCatalog};

/// Maps the statement ids one client session holds to proxy-global ids.
///
/// A client may PREPARE the same logical statement more than once, so one
/// global id can back several client ids at a time; each close releases
/// exactly one of them. Client ids start at 1 (0 means "none" on the
/// wire) and closed ids are reused LIFO before the counter grows.
pub struct ClientStmtTable {
    catalog: Arc<StmtCatalog>,
    client_to_global: HashMap<ClientStmtId, GlobalStmtId>,
    /// Reverse side, one entry per outstanding client id
    global_to_client: HashMap<GlobalStmtId, Vec<ClientStmtId>>,
    free_ids: Vec<ClientStmtId>,
    next_id: u32,
}

impl ClientStmtTable {
    pub fn new(catalog: Arc<StmtCatalog>) -> Self {
        ClientStmtTable {
            catalog,
            client_to_global: HashMap::new(),
            global_to_client: HashMap::new(),
            free_ids: Vec::new(),
            next_id: 1,
        }
    }

    /// Mint a client id bound to `global_id`.
    ///
    /// Consumes the client reference the resolve that produced
    /// `global_id` reserved; the balancing decrement happens in
    /// [`close_client`](Self::close_client) or at session teardown.
    pub fn register_client(&mut self, global_id: GlobalStmtId) -> ClientStmtId {
        let client_id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = ClientStmtId::new(self.next_id);
                self.next_id += 1;
                id
            }
        };
        self.client_to_global.insert(client_id, global_id);
        self.global_to_client
            .entry(global_id)
            .or_default()
            .push(client_id);
        client_id
    }

    /// Translate a client id to the proxy-global id it is bound to.
    pub fn lookup_global(&self, client_id: ClientStmtId) -> Option<GlobalStmtId> {
        self.client_to_global.get(&client_id).copied()
    }

    /// Close a client handle and release its catalog reference.
    ///
    /// An id this session never issued is a protocol violation on the
    /// client's part, reported as [`RegistryError::UnknownClientStmt`];
    /// the session survives it.
    pub fn close_client(&mut self, client_id: ClientStmtId) -> RegistryResult<GlobalStmtId> {
        let global_id = self
            .client_to_global
            .remove(&client_id)
            .ok_or(RegistryError::UnknownClientStmt(client_id))?;
        if let Some(ids) = self.global_to_client.get_mut(&global_id) {
            if let Some(pos) = ids.iter().position(|&c| c == client_id) {
                ids.swap_remove(pos);
            }
            if ids.is_empty() {
                self.global_to_client.remove(&global_id);
            }
        }
        self.free_ids.push(client_id);
        self.catalog.ref_client(global_id, -1)?;
        Ok(global_id)
    }

    /// Outstanding client handles in this session.
    pub fn num_client_stmts(&self) -> usize {
        self.client_to_global.len()
    }

    /// Client ids currently bound to `global_id`.
    pub fn client_ids_for(&self, global_id: GlobalStmtId) -> &[ClientStmtId] {
        self.global_to_client
            .get(&global_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }
}

impl Drop for ClientStmtTable {
    /// A session that dies with open handles must not leak catalog
    /// references. Teardown always runs to completion; secondary errors
    /// are logged and swallowed.
    fn drop(&mut self) {
        for (&client_id, &global_id) in &self.client_to_global {
            if let Err(e) = self.catalog.ref_client(global_id, -1) {
                tracing::warn!(%client_id, %global_id, error = %e,
                    "client handle release failed during teardown");
            }
        }
    }
}
