//! Prepared statement command flow
//!
//! Glue between the wire layer, the session tables, and the catalog for
//! the prepared-statement commands the proxy forwards. Backend round-trips
//! always happen outside any catalog lock; the registry is re-entered with
//! the results.

use thiserror::Error;
use tracing::debug;

use crate::driver::{BackendConn, ColumnDescriptor, DriverError, PreparedStmt};
use crate::ids::{BackendStmtId, ClientStmtId, GlobalStmtId};
use crate::registry::{
    QueryDigest, RegistryError, StmtCatalog, StmtProperties, StmtScope,
};
use crate::session::{
    BackendStmtTable, ClientStmtTable, ExecMetaRecord, ExecMetaTable, LongDataBuffer,
};

/// Errors surfaced by the command flow.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("backend driver: {0}")]
    Driver(#[from] DriverError),
}

/// Result type for flow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Everything the wire layer needs to assemble a `COM_STMT_PREPARE`
/// response.
#[derive(Debug)]
pub struct PrepareReply {
    pub client_id: ClientStmtId,
    pub global_id: GlobalStmtId,
    pub num_columns: u16,
    pub num_params: u16,
    pub warning_count: u16,
    pub fields: Vec<ColumnDescriptor>,
    /// Set when this prepare displaced a drift-retired entry; client
    /// handles still bound to it must re-prepare
    pub replaced: Option<GlobalStmtId>,
}

/// Handle a client PREPARE.
///
/// A statement already in the catalog is served straight from cached
/// metadata. Otherwise it is physically prepared on `conn`, published in
/// the catalog, and the new backend binding recorded in `backend_tbl`;
/// racing inserts from other sessions fold into whichever entry was
/// published first.
pub async fn client_prepare(
    catalog: &StmtCatalog,
    client_tbl: &mut ClientStmtTable,
    backend_tbl: &mut BackendStmtTable,
    conn: &mut dyn BackendConn,
    scope: &StmtScope,
    query: &str,
    digest: &QueryDigest,
    properties: StmtProperties,
) -> FlowResult<PrepareReply> {
    if let Some(resolved) = catalog.resolve_cached(scope, query) {
        let client_id = client_tbl.register_client(resolved.id);
        debug!(%client_id, global_id = %resolved.id, "prepare served from catalog");
        return reply_for(catalog, client_id, resolved.id, None);
    }

    let PreparedStmt { handle, descriptor } = conn.prepare_stmt(query).await?;
    let backend_id = handle.backend_id();
    let resolved = catalog.resolve_or_insert(scope, query, digest, descriptor, properties)?;
    backend_tbl.insert(resolved.id, backend_id, handle)?;
    let client_id = client_tbl.register_client(resolved.id);
    debug!(%client_id, global_id = %resolved.id, was_new = resolved.was_new,
        "prepare published");
    reply_for(catalog, client_id, resolved.id, resolved.replaced)
}

fn reply_for(
    catalog: &StmtCatalog,
    client_id: ClientStmtId,
    global_id: GlobalStmtId,
    replaced: Option<GlobalStmtId>,
) -> FlowResult<PrepareReply> {
    // the entry cannot retire while this client reference is outstanding
    let info = catalog
        .find_by_id(global_id)
        .ok_or(RegistryError::UnknownGlobalStmt(global_id))?;
    Ok(PrepareReply {
        client_id,
        global_id,
        num_columns: info.num_columns,
        num_params: info.num_params,
        warning_count: info.warning_count,
        fields: info.fields.clone(),
        replaced,
    })
}

/// The physical binding an EXECUTE runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecBinding {
    pub global_id: GlobalStmtId,
    pub backend_id: BackendStmtId,
}

/// Translate a client EXECUTE to a physical backend statement, preparing
/// lazily when this connection has no binding yet.
///
/// Drift detected during the lazy prepare surfaces as
/// [`RegistryError::FingerprintDrift`]; the wire layer turns it into a
/// "re-prepare required" error for the client. The freshly prepared
/// handle is discarded in that case (dropping it closes the physical
/// statement).
pub async fn bind_for_execute(
    catalog: &StmtCatalog,
    client_tbl: &ClientStmtTable,
    backend_tbl: &mut BackendStmtTable,
    conn: &mut dyn BackendConn,
    client_id: ClientStmtId,
) -> FlowResult<ExecBinding> {
    let global_id = client_tbl
        .lookup_global(client_id)
        .ok_or(RegistryError::UnknownClientStmt(client_id))?;

    if let Some(backend_id) = backend_tbl.backend_id_for(global_id) {
        return Ok(ExecBinding {
            global_id,
            backend_id,
        });
    }

    // Not yet prepared on this connection: fetch the query text, release
    // the read guard, and do the round-trip outside the lock.
    let query = match catalog.find_by_id(global_id) {
        Some(info) => info.query.clone(),
        None => return Err(RegistryError::UnknownGlobalStmt(global_id).into()),
    };

    let PreparedStmt { handle, descriptor } = conn.prepare_stmt(&query).await?;
    let backend_id = handle.backend_id();
    catalog.verify_metadata(global_id, &descriptor)?;
    backend_tbl.insert(global_id, backend_id, handle)?;
    debug!(%global_id, %backend_id, "lazily prepared on backend");
    Ok(ExecBinding {
        global_id,
        backend_id,
    })
}

/// A long-data parameter ready for handoff to the backend driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongParam<'a> {
    pub param_id: u16,
    pub data: &'a [u8],
    pub is_null: bool,
}

/// Pending execute state assembled for the backend driver.
#[derive(Debug)]
pub struct ExecutePayload<'a> {
    /// Bindings captured from the execute packet, if any
    pub meta: Option<&'a ExecMetaRecord>,
    /// Parameters streamed via SEND_LONG_DATA, in parameter order
    pub long_data: Vec<LongParam<'a>>,
}

/// Merge pending execute metadata with accumulated long-data chunks for
/// one statement.
pub fn execute_payload<'a>(
    exec_meta: &'a ExecMetaTable,
    long_data: &'a LongDataBuffer,
    client_id: ClientStmtId,
    global_id: GlobalStmtId,
    num_params: u16,
) -> ExecutePayload<'a> {
    let long_data = (0..num_params)
        .filter_map(|param_id| {
            long_data
                .get(client_id, param_id)
                .map(|(data, is_null)| LongParam {
                    param_id,
                    data,
                    is_null,
                })
        })
        .collect();
    ExecutePayload {
        meta: exec_meta.find(global_id),
        long_data,
    }
}

/// Handle a client CLOSE: release the handle and evict the pending
/// execute state that belonged to it.
pub fn client_close(
    client_tbl: &mut ClientStmtTable,
    exec_meta: &mut ExecMetaTable,
    long_data: &mut LongDataBuffer,
    client_id: ClientStmtId,
) -> FlowResult<()> {
    let global_id = client_tbl.close_client(client_id)?;
    // execute metadata is keyed by global id; keep it while other handles
    // in this session still point at the same statement
    if client_tbl.client_ids_for(global_id).is_empty() {
        exec_meta.erase(global_id);
    }
    long_data.reset(client_id);
    debug!(%client_id, %global_id, "client closed statement");
    Ok(())
}
