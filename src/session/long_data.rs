//! SEND_LONG_DATA accumulation

use std::collections::HashMap;

use crate::ids::ClientStmtId;

/// Accumulated chunks for one parameter.
#[derive(Debug, Default)]
struct LongDataEntry {
    data: Vec<u8>,
    is_null: bool,
}

/// Per-session accumulator for `COM_STMT_SEND_LONG_DATA` chunks.
///
/// Chunks arrive between PREPARE and EXECUTE and are concatenated in
/// arrival order, keyed by (client statement id, parameter index). The
/// accumulated bytes survive EXECUTE retrieval; the wire layer resets the
/// statement's entries once the execute completes or aborts, and the whole
/// buffer dies with its session.
#[derive(Debug, Default)]
pub struct LongDataBuffer {
    entries: HashMap<(ClientStmtId, u16), LongDataEntry>,
}

impl LongDataBuffer {
    pub fn new() -> Self {
        LongDataBuffer::default()
    }

    /// Append one chunk for (stmt, param), creating the entry if absent.
    pub fn add(&mut self, stmt_id: ClientStmtId, param_id: u16, chunk: &[u8]) {
        let entry = self.entries.entry((stmt_id, param_id)).or_default();
        entry.data.extend_from_slice(chunk);
    }

    /// The accumulated bytes and null flag, without clearing them.
    pub fn get(&self, stmt_id: ClientStmtId, param_id: u16) -> Option<(&[u8], bool)> {
        self.entries
            .get(&(stmt_id, param_id))
            .map(|e| (e.data.as_slice(), e.is_null))
    }

    /// Drop everything accumulated for `stmt_id`; returns how many
    /// parameters were cleared.
    pub fn reset(&mut self, stmt_id: ClientStmtId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&(sid, _), _| sid != stmt_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
