//! stmtmux - prepared statement registry for a MySQL protocol proxy
//!
//! A single logical prepared statement may be physically prepared on many
//! backend connections, each assigning its own statement id, while clients
//! hold long-lived handles that must outlive any one backend connection.
//! The proxy therefore mints its own statement ids and keeps three handle
//! spaces mutually consistent:
//!
//! - client ids, scoped to one client session and recycled on close
//! - proxy-global ids, allocated by the shared catalog
//! - backend ids, assigned by each MySQL server connection
//!
//! The catalog deduplicates statements by a (hostgroup, user, schema,
//! query) fingerprint, serves cached metadata for repeat prepares, and
//! retires entries once both client handles and backend bindings are gone.

pub mod driver;
pub mod flow;
pub mod ids;
pub mod registry;
pub mod session;
