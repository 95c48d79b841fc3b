//! Admin snapshot of the statement catalog

use super::info::StmtInfo;

/// One row of the admin prepared-statements table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtSnapshotRow {
    pub hostgroup: u32,
    pub schemaname: String,
    pub username: String,
    pub digest: u64,
    pub ref_count_client: i32,
    pub ref_count_server: i32,
    pub num_columns: u16,
    pub num_params: u16,
    pub num_warnings: u16,
    pub query: String,
}

impl StmtSnapshotRow {
    /// Column names in admin display order.
    pub const COLUMNS: [&'static str; 10] = [
        "hostgroup",
        "schemaname",
        "username",
        "digest",
        "ref_count_client",
        "ref_count_server",
        "num_columns",
        "num_params",
        "num_warnings",
        "query",
    ];

    pub(crate) fn from_info(info: &StmtInfo) -> Self {
        StmtSnapshotRow {
            hostgroup: info.hostgroup_id,
            schemaname: info.schemaname.clone(),
            username: info.username.clone(),
            digest: info.digest,
            ref_count_client: info.ref_count_client,
            ref_count_server: info.ref_count_server,
            num_columns: info.num_columns,
            num_params: info.num_params,
            num_warnings: info.warning_count,
            query: info.query.clone(),
        }
    }

    /// Digest rendered the way the admin table prints it.
    pub fn digest_hex(&self) -> String {
        format!("{:#018x}", self.digest)
    }
}
