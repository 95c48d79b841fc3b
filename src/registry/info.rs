//! Prepared statement metadata

use xxhash_rust::xxh3::xxh3_64;

use crate::driver::{ColumnDescriptor, StmtDescriptor};
use crate::ids::GlobalStmtId;

/// The session half of the deduplication tuple.
///
/// Two textually identical queries prepared under different hostgroups,
/// users, or schemas are different logical statements and must never share
/// a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtScope {
    pub hostgroup_id: u32,
    pub username: String,
    pub schemaname: String,
}

impl StmtScope {
    pub fn new(hostgroup_id: u32, username: impl Into<String>, schemaname: impl Into<String>) -> Self {
        StmtScope {
            hostgroup_id,
            username: username.into(),
            schemaname: schemaname.into(),
        }
    }
}

/// Per-statement tunables, stored verbatim.
///
/// The registry records these; enforcement belongs to the cache and
/// execution layers that read them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtProperties {
    /// Result cache TTL in milliseconds; -1 inherits the global setting
    pub cache_ttl: i32,
    /// Execution timeout in milliseconds; 0 disables
    pub timeout: i32,
    /// Artificial execution delay in milliseconds; 0 disables
    pub delay: i32,
}

impl Default for StmtProperties {
    fn default() -> Self {
        StmtProperties {
            cache_ttl: -1,
            timeout: 0,
            delay: 0,
        }
    }
}

/// Digest produced by the query fingerprinter collaborator for an
/// incoming query: a stable hash of the canonicalized text plus the
/// canonicalized text itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDigest {
    pub digest: u64,
    pub text: String,
}

/// SQL verb family of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Set,
    Show,
    Begin,
    Commit,
    Rollback,
    Create,
    Alter,
    Drop,
    Call,
    Unknown,
}

impl CommandKind {
    /// Classify a query by its leading verb.
    pub fn from_query(query: &str) -> Self {
        let rest = query.trim_start();
        let end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        match rest[..end].to_ascii_uppercase().as_str() {
            "SELECT" => CommandKind::Select,
            "INSERT" => CommandKind::Insert,
            "UPDATE" => CommandKind::Update,
            "DELETE" => CommandKind::Delete,
            "REPLACE" => CommandKind::Replace,
            "SET" => CommandKind::Set,
            "SHOW" => CommandKind::Show,
            "BEGIN" => CommandKind::Begin,
            "COMMIT" => CommandKind::Commit,
            "ROLLBACK" => CommandKind::Rollback,
            "CREATE" => CommandKind::Create,
            "ALTER" => CommandKind::Alter,
            "DROP" => CommandKind::Drop,
            "CALL" => CommandKind::Call,
            _ => CommandKind::Unknown,
        }
    }
}

/// Whether a query is a plain SELECT, i.e. one that does not end in
/// `FOR UPDATE` and can safely be routed to a reader.
pub fn is_select_not_for_update(query: &str) -> bool {
    let trimmed = query.trim();
    if CommandKind::from_query(trimmed) != CommandKind::Select {
        return false;
    }
    const SUFFIX: &[u8] = b"FOR UPDATE";
    let bytes = trimmed.as_bytes();
    if bytes.len() >= SUFFIX.len() {
        let tail = &bytes[bytes.len() - SUFFIX.len()..];
        if tail.eq_ignore_ascii_case(SUFFIX) {
            return false;
        }
    }
    true
}

/// Compute the deduplication fingerprint for a statement.
///
/// Pure function of (hostgroup, user, schema, query). Collisions are
/// possible and are resolved by full-tuple comparison in the catalog;
/// hash equality alone never identifies a statement.
pub fn fingerprint(scope: &StmtScope, query: &str) -> u64 {
    let mut buf = Vec::with_capacity(
        4 + scope.username.len() + scope.schemaname.len() + query.len() + 3,
    );
    buf.extend_from_slice(&scope.hostgroup_id.to_le_bytes());
    buf.push(0x00);
    buf.extend_from_slice(scope.username.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(scope.schemaname.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(query.as_bytes());
    xxh3_64(&buf)
}

/// Metadata for one logical prepared statement.
///
/// Constructed by the catalog when the statement is first published.
/// Everything except the two reference counts and `warning_count` is fixed
/// at publication: a re-prepare that reports different column or parameter
/// counts retires the entry and publishes a replacement instead of
/// mutating it.
#[derive(Debug)]
pub struct StmtInfo {
    pub global_id: GlobalStmtId,
    pub fingerprint: u64,
    pub digest: u64,
    pub digest_text: String,
    pub command_kind: CommandKind,
    pub hostgroup_id: u32,
    pub username: String,
    pub schemaname: String,
    pub query: String,
    pub num_columns: u16,
    pub num_params: u16,
    pub warning_count: u16,
    pub fields: Vec<ColumnDescriptor>,
    pub properties: StmtProperties,
    pub is_select_not_for_update: bool,
    /// Outstanding client handles across all sessions; never negative
    pub ref_count_client: i32,
    /// Outstanding backend bindings across all connections; never negative
    pub ref_count_server: i32,
}

impl StmtInfo {
    pub(crate) fn new(
        global_id: GlobalStmtId,
        fingerprint: u64,
        scope: &StmtScope,
        query: &str,
        digest: &QueryDigest,
        descriptor: StmtDescriptor,
        properties: StmtProperties,
    ) -> Self {
        StmtInfo {
            global_id,
            fingerprint,
            digest: digest.digest,
            digest_text: digest.text.clone(),
            command_kind: CommandKind::from_query(query),
            hostgroup_id: scope.hostgroup_id,
            username: scope.username.clone(),
            schemaname: scope.schemaname.clone(),
            query: query.to_string(),
            num_columns: descriptor.num_columns,
            num_params: descriptor.num_params,
            warning_count: descriptor.warning_count,
            fields: descriptor.fields,
            properties,
            is_select_not_for_update: is_select_not_for_update(query),
            ref_count_client: 1,
            ref_count_server: 0,
        }
    }

    /// Full-tuple equality; the fingerprint alone is never trusted.
    pub fn matches(&self, scope: &StmtScope, query: &str) -> bool {
        self.hostgroup_id == scope.hostgroup_id
            && self.username == scope.username
            && self.schemaname == scope.schemaname
            && self.query == query
    }
}
