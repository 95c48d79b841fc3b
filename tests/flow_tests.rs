//! Command flow tests
//!
//! Drive PREPARE / EXECUTE / CLOSE through the flow layer against a
//! scripted mock driver, checking cache hits, lazy backend preparation,
//! drift handling, and physical statement cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use stmtmux::driver::{
    BackendConn, BackendHandle, BackendStmt, ColumnDescriptor, ColumnType, DriverResult,
    PreparedStmt, StmtDescriptor,
};
use stmtmux::flow::{self, FlowError};
use stmtmux::ids::{BackendStmtId, ClientStmtId};
use stmtmux::registry::{QueryDigest, RegistryError, StmtCatalog, StmtProperties, StmtScope};
use stmtmux::session::{
    BackendStmtTable, ClientStmtTable, ExecMetaRecord, ExecMetaTable, LongDataBuffer,
};

#[derive(Debug)]
struct MockStmt {
    id: BackendStmtId,
    closed: Arc<AtomicUsize>,
}

impl BackendStmt for MockStmt {
    fn backend_id(&self) -> BackendStmtId {
        self.id
    }
}

impl Drop for MockStmt {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted backend connection: hands out sequential backend ids and a
/// configurable descriptor, and records every query it prepared.
struct MockConn {
    next_backend_id: u32,
    num_columns: u16,
    num_params: u16,
    prepared: Vec<String>,
    closed: Arc<AtomicUsize>,
}

impl MockConn {
    fn new(first_backend_id: u32, closed: Arc<AtomicUsize>) -> Self {
        MockConn {
            next_backend_id: first_backend_id,
            num_columns: 1,
            num_params: 0,
            prepared: Vec::new(),
            closed,
        }
    }
}

#[async_trait]
impl BackendConn for MockConn {
    async fn prepare_stmt(&mut self, query: &str) -> DriverResult<PreparedStmt> {
        self.prepared.push(query.to_string());
        let id = BackendStmtId::new(self.next_backend_id);
        self.next_backend_id += 1;
        Ok(PreparedStmt {
            handle: Box::new(MockStmt {
                id,
                closed: self.closed.clone(),
            }) as BackendHandle,
            descriptor: StmtDescriptor {
                num_columns: self.num_columns,
                num_params: self.num_params,
                warning_count: 0,
                fields: (0..self.num_columns)
                    .map(|i| ColumnDescriptor::new(format!("c{i}"), ColumnType::Long))
                    .collect(),
            },
        })
    }
}

fn scope() -> StmtScope {
    StmtScope::new(0, "u", "s")
}

fn digest(query: &str) -> QueryDigest {
    QueryDigest {
        digest: 0xfeed,
        text: query.to_string(),
    }
}

// ============================================================================
// PREPARE
// ============================================================================

#[tokio::test]
async fn test_prepare_miss_hits_backend_once() {
    let closed = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut c2 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut conn = MockConn::new(100, closed.clone());

    let reply = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn,
        &scope(),
        "SELECT 1",
        &digest("SELECT 1"),
        StmtProperties::default(),
    )
    .await
    .unwrap();

    assert_eq!(reply.client_id, ClientStmtId::new(1));
    assert_eq!(reply.num_columns, 1);
    assert_eq!(reply.fields.len(), 1);
    assert_eq!(conn.prepared, vec!["SELECT 1".to_string()]);
    assert_eq!(
        b1.backend_id_for(reply.global_id),
        Some(BackendStmtId::new(100))
    );

    // a second client's prepare is served from the catalog
    let reply2 = flow::client_prepare(
        &catalog,
        &mut c2,
        &mut b1,
        &mut conn,
        &scope(),
        "SELECT 1",
        &digest("SELECT 1"),
        StmtProperties::default(),
    )
    .await
    .unwrap();

    assert_eq!(reply2.global_id, reply.global_id);
    assert_eq!(conn.prepared.len(), 1);
    assert_eq!(
        catalog.find_by_id(reply.global_id).unwrap().ref_count_client,
        2
    );
}

// ============================================================================
// EXECUTE
// ============================================================================

#[tokio::test]
async fn test_execute_prepares_lazily_per_backend() {
    let closed = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut b2 = BackendStmtTable::new(catalog.clone());
    let mut conn1 = MockConn::new(100, closed.clone());
    let mut conn2 = MockConn::new(200, closed.clone());

    let reply = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn1,
        &scope(),
        "SELECT 1",
        &digest("SELECT 1"),
        StmtProperties::default(),
    )
    .await
    .unwrap();

    // executing on the backend that prepared needs no round-trip
    let bind1 = flow::bind_for_execute(&catalog, &c1, &mut b1, &mut conn1, reply.client_id)
        .await
        .unwrap();
    assert_eq!(bind1.backend_id, BackendStmtId::new(100));
    assert_eq!(conn1.prepared.len(), 1);

    // a different backend connection prepares lazily on first execute
    let bind2 = flow::bind_for_execute(&catalog, &c1, &mut b2, &mut conn2, reply.client_id)
        .await
        .unwrap();
    assert_eq!(bind2.backend_id, BackendStmtId::new(200));
    assert_eq!(conn2.prepared, vec!["SELECT 1".to_string()]);
    assert_eq!(
        catalog.find_by_id(reply.global_id).unwrap().ref_count_server,
        2
    );

    // and only once
    let again = flow::bind_for_execute(&catalog, &c1, &mut b2, &mut conn2, reply.client_id)
        .await
        .unwrap();
    assert_eq!(again, bind2);
    assert_eq!(conn2.prepared.len(), 1);
}

#[tokio::test]
async fn test_execute_with_unknown_client_id() {
    let catalog = Arc::new(StmtCatalog::new());
    let c1 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut conn = MockConn::new(100, Arc::new(AtomicUsize::new(0)));

    let err = flow::bind_for_execute(&catalog, &c1, &mut b1, &mut conn, ClientStmtId::new(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Registry(RegistryError::UnknownClientStmt(_))
    ));
}

#[tokio::test]
async fn test_drift_on_lazy_prepare_requires_reprepare() {
    let closed = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut b2 = BackendStmtTable::new(catalog.clone());
    let mut conn1 = MockConn::new(100, closed.clone());
    let mut conn2 = MockConn::new(200, closed.clone());

    let reply = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn1,
        &scope(),
        "SELECT a FROM t",
        &digest("SELECT a FROM t"),
        StmtProperties::default(),
    )
    .await
    .unwrap();

    // the schema changed behind the proxy's back: the second backend now
    // reports a different column count
    conn2.num_columns = 3;
    let err = flow::bind_for_execute(&catalog, &c1, &mut b2, &mut conn2, reply.client_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Registry(RegistryError::FingerprintDrift { .. })
    ));

    // the discarded handle closed its physical statement
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(b2.num_backend_stmts(), 0);

    // the drifted entry is detached: the next prepare republishes
    let reply2 = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b2,
        &mut conn2,
        &scope(),
        "SELECT a FROM t",
        &digest("SELECT a FROM t"),
        StmtProperties::default(),
    )
    .await
    .unwrap();
    assert_ne!(reply2.global_id, reply.global_id);
    assert_eq!(reply2.num_columns, 3);
}

// ============================================================================
// Long data and execute payload
// ============================================================================

#[tokio::test]
async fn test_execute_payload_merges_meta_and_long_data() {
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut conn = MockConn::new(100, Arc::new(AtomicUsize::new(0)));
    conn.num_params = 2;

    let reply = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn,
        &scope(),
        "INSERT INTO t VALUES (?, ?)",
        &digest("INSERT INTO t VALUES (?, ?)"),
        StmtProperties::default(),
    )
    .await
    .unwrap();
    assert_eq!(reply.num_params, 2);

    let mut exec_meta = ExecMetaTable::new();
    let mut long_data = LongDataBuffer::new();

    exec_meta.insert(
        reply.global_id,
        ExecMetaRecord {
            num_params: 2,
            ..ExecMetaRecord::default()
        },
    );
    long_data.add(reply.client_id, 0, b"foo");
    long_data.add(reply.client_id, 0, b"bar");
    long_data.add(reply.client_id, 1, b"baz");

    let payload = flow::execute_payload(
        &exec_meta,
        &long_data,
        reply.client_id,
        reply.global_id,
        reply.num_params,
    );
    assert_eq!(payload.meta.unwrap().num_params, 2);
    assert_eq!(payload.long_data.len(), 2);
    assert_eq!(payload.long_data[0].param_id, 0);
    assert_eq!(payload.long_data[0].data, b"foobar");
    assert_eq!(payload.long_data[1].data, b"baz");

    // CLOSE evicts both
    flow::client_close(&mut c1, &mut exec_meta, &mut long_data, reply.client_id).unwrap();
    assert!(exec_meta.is_empty());
    assert!(long_data.is_empty());
}

// ============================================================================
// CLOSE and teardown
// ============================================================================

#[tokio::test]
async fn test_close_keeps_meta_while_other_handles_remain() {
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut b1 = BackendStmtTable::new(catalog.clone());
    let mut conn = MockConn::new(100, Arc::new(AtomicUsize::new(0)));

    let first = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn,
        &scope(),
        "SELECT 1",
        &digest("SELECT 1"),
        StmtProperties::default(),
    )
    .await
    .unwrap();
    let second = flow::client_prepare(
        &catalog,
        &mut c1,
        &mut b1,
        &mut conn,
        &scope(),
        "SELECT 1",
        &digest("SELECT 1"),
        StmtProperties::default(),
    )
    .await
    .unwrap();
    assert_eq!(first.global_id, second.global_id);

    let mut exec_meta = ExecMetaTable::new();
    let mut long_data = LongDataBuffer::new();
    exec_meta.insert(first.global_id, ExecMetaRecord::default());

    // one of the two handles closes; the shared record stays
    flow::client_close(&mut c1, &mut exec_meta, &mut long_data, first.client_id).unwrap();
    assert!(exec_meta.find(first.global_id).is_some());

    // the last handle closes; the record goes with it
    flow::client_close(&mut c1, &mut exec_meta, &mut long_data, second.client_id).unwrap();
    assert!(exec_meta.is_empty());
}

#[tokio::test]
async fn test_backend_table_drop_closes_physical_statements() {
    let closed = Arc::new(AtomicUsize::new(0));
    let catalog = Arc::new(StmtCatalog::new());
    let mut c1 = ClientStmtTable::new(catalog.clone());
    let mut conn = MockConn::new(100, closed.clone());

    let global_id = {
        let mut b1 = BackendStmtTable::new(catalog.clone());
        let reply = flow::client_prepare(
            &catalog,
            &mut c1,
            &mut b1,
            &mut conn,
            &scope(),
            "SELECT 1",
            &digest("SELECT 1"),
            StmtProperties::default(),
        )
        .await
        .unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        reply.global_id
    };

    // the backend session died: its handle was closed, the server ref
    // released, and the entry survives on the client reference alone
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    let info = catalog.find_by_id(global_id).unwrap();
    assert_eq!(info.ref_count_server, 0);
    assert_eq!(info.ref_count_client, 1);
}
