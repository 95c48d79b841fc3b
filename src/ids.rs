//! Typed statement identifiers
//!
//! A prepared statement lives in three independent handle spaces at once:
//! the id a client session holds, the id the proxy allocated for the
//! logical statement, and the id a backend server assigned on one of its
//! connections. The spaces are kept apart at the type level so that
//! handing an id from one space to an API expecting another is a compile
//! error rather than a silent mixup.

use std::fmt;

/// Proxy-global statement id, allocated by the catalog.
///
/// Unique across the whole proxy process. Reused only after the statement
/// has been fully released by both clients and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalStmtId(u64);

impl GlobalStmtId {
    pub const fn new(id: u64) -> Self {
        GlobalStmtId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalStmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statement id visible to one client session.
///
/// Ids start at 1; 0 is reserved as "none" on the wire. Closed ids are
/// recycled within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientStmtId(u32);

impl ClientStmtId {
    pub const fn new(id: u32) -> Self {
        ClientStmtId(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientStmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Statement id assigned by a backend server.
///
/// Opaque to the proxy and valid only for the lifetime of the backend
/// connection that prepared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendStmtId(u32);

impl BackendStmtId {
    pub const fn new(id: u32) -> Self {
        BackendStmtId(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BackendStmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
