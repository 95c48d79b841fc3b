//! Global prepared statement registry
//!
//! A single logical prepared statement can be physically prepared on
//! several backend connections, and on each backend it gets a different
//! statement id. The proxy therefore returns its own ids to clients and
//! keeps the mapping internal: the catalog stores statement metadata once
//! per distinct (hostgroup, user, schema, query) tuple and allocates the
//! proxy-global id that every session table refers back to.
//!
//! The catalog is the only structure shared across worker threads; see
//! [`StmtCatalog`] for the locking discipline.

mod catalog;
mod info;
mod snapshot;

pub use catalog::{CatalogMetrics, FingerprintFn, Resolved, StmtCatalog};
pub use info::{
    fingerprint, is_select_not_for_update, CommandKind, QueryDigest, StmtInfo, StmtProperties,
    StmtScope,
};
pub use snapshot::StmtSnapshotRow;

use std::fmt;

use thiserror::Error;

use crate::ids::{ClientStmtId, GlobalStmtId};

/// Which reference count an adjustment touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefSide {
    Client,
    Server,
}

impl fmt::Display for RefSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefSide::Client => write!(f, "client"),
            RefSide::Server => write!(f, "server"),
        }
    }
}

/// Registry operation errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Client used a statement id this session never issued.
    /// A protocol violation on the client's part, not fatal to the proxy.
    #[error("unknown client statement id {0}")]
    UnknownClientStmt(ClientStmtId),

    /// Reference adjustment against an id the catalog does not hold;
    /// indicates a caller bug
    #[error("unknown global statement id {0}")]
    UnknownGlobalStmt(GlobalStmtId),

    /// A decrement would push a reference count below zero; indicates
    /// unbalanced lifecycle calls somewhere upstream
    #[error("{side} reference count underflow on statement {id}")]
    RefCountUnderflow { id: GlobalStmtId, side: RefSide },

    /// Statement metadata changed on the backend; holders of the old
    /// entry must re-prepare
    #[error("statement {id} metadata changed (fingerprint {fingerprint:#018x}): re-prepare required")]
    FingerprintDrift { id: GlobalStmtId, fingerprint: u64 },

    /// The global statement id space is exhausted
    #[error("global statement id space exhausted")]
    CatalogExhausted,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
