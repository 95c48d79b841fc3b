//! Client-side EXECUTE metadata cache
//!
//! Server side, execute metadata lives in the physical statement itself.
//! Client side, the proxy captures it from the `COM_STMT_EXECUTE` payload
//! so the statement can be replayed on another backend after a failover.

use std::collections::HashMap;

use crate::driver::ColumnType;
use crate::ids::GlobalStmtId;

/// One bound parameter of a pending EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamBind {
    pub column_type: ColumnType,
    pub unsigned_flag: bool,
    pub value: Vec<u8>,
}

/// Parameter bindings captured from an execute payload.
///
/// The record owns every buffer it holds; eviction or overwrite releases
/// them. `is_nulls` and `lengths` run parallel to `binds`, all of length
/// `num_params`.
#[derive(Debug, Clone, Default)]
pub struct ExecMetaRecord {
    pub num_params: u16,
    pub flags: u8,
    pub binds: Vec<ParamBind>,
    pub is_nulls: Vec<bool>,
    pub lengths: Vec<u32>,
    /// Original execute payload, re-sent verbatim when the statement is
    /// replayed on another backend
    pub raw_packet: Vec<u8>,
}

/// Per-session map from global statement id to pending execute metadata.
#[derive(Debug, Default)]
pub struct ExecMetaTable {
    entries: HashMap<GlobalStmtId, ExecMetaRecord>,
}

impl ExecMetaTable {
    pub fn new() -> Self {
        ExecMetaTable::default()
    }

    /// Store `record`, replacing (and releasing) any previous record for
    /// the same statement.
    pub fn insert(&mut self, global_id: GlobalStmtId, record: ExecMetaRecord) {
        self.entries.insert(global_id, record);
    }

    pub fn find(&self, global_id: GlobalStmtId) -> Option<&ExecMetaRecord> {
        self.entries.get(&global_id)
    }

    /// Evict the record for `global_id`; returns whether one was present.
    pub fn erase(&mut self, global_id: GlobalStmtId) -> bool {
        self.entries.remove(&global_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
