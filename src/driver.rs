//! Backend driver capability
//!
//! The registry never talks to a MySQL server itself. It consumes one
//! narrow capability: given a backend connection and a query, physically
//! prepare the statement and report the resulting handle plus its
//! metadata. Everything else about the driver (execution, result sets,
//! connection pooling) is invisible here.

use std::fmt;
use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::ids::BackendStmtId;

/// Wire protocol column type codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0a,
    Time = 0x0b,
    Datetime = 0x0c,
    Year = 0x0d,
    Varchar = 0x0f,
    Bit = 0x10,
    NewDecimal = 0xf6,
    Enum = 0xf7,
    Set = 0xf8,
    TinyBlob = 0xf9,
    MediumBlob = 0xfa,
    LongBlob = 0xfb,
    Blob = 0xfc,
    VarString = 0xfd,
    String = 0xfe,
    Geometry = 0xff,
}

impl From<ColumnType> for u8 {
    fn from(ct: ColumnType) -> u8 {
        ct as u8
    }
}

/// utf8mb4_general_ci, the character set backends report by default
pub const UTF8MB4_GENERAL_CI: u16 = 45;

/// Column metadata for one result column of a prepared statement.
///
/// Field layout mirrors the MySQL column definition payload so the wire
/// layer can serialize a `COM_STMT_PREPARE` response straight from the
/// cached descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Catalog (always "def")
    pub catalog: String,
    /// Schema (database name)
    pub schema: String,
    /// Virtual table name (may be alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Virtual column name (may be alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Character set
    pub character_set: u16,
    /// Maximum column length
    pub column_length: u32,
    /// Column type
    pub column_type: ColumnType,
    /// Column flags
    pub flags: u16,
    /// Decimals (for numeric types)
    pub decimals: u8,
}

impl ColumnDescriptor {
    /// Create a descriptor with the common defaults filled in.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        ColumnDescriptor {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            character_set: UTF8MB4_GENERAL_CI,
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    /// Set the maximum column length
    #[must_use]
    pub fn column_length(mut self, len: u32) -> Self {
        self.column_length = len;
        self
    }

    /// Set the column flags
    #[must_use]
    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }
}

/// Statement metadata reported by a backend prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtDescriptor {
    /// Result columns the statement produces
    pub num_columns: u16,
    /// Parameter placeholders the statement takes
    pub num_params: u16,
    /// Warnings the backend raised while preparing
    pub warning_count: u16,
    /// One descriptor per result column, length `num_columns`
    pub fields: Vec<ColumnDescriptor>,
}

/// Opaque server-side statement resource.
///
/// The driver supplies the implementation; dropping the handle closes the
/// physical statement on its backend connection. The proxy only ever asks
/// a handle which id the server assigned to it.
pub trait BackendStmt: Send + fmt::Debug {
    /// The statement id the backend server assigned.
    fn backend_id(&self) -> BackendStmtId;
}

/// Owned handle to a physical backend statement.
pub type BackendHandle = Box<dyn BackendStmt>;

/// A successful backend prepare: the physical handle and what the server
/// told us about the statement.
#[derive(Debug)]
pub struct PreparedStmt {
    pub handle: BackendHandle,
    pub descriptor: StmtDescriptor,
}

/// Backend driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// The server rejected the prepare
    #[error("backend error {code}: {message}")]
    Server { code: u16, message: String },

    /// The backend connection went away mid-operation
    #[error("backend connection closed")]
    ConnectionClosed,

    /// I/O error talking to the backend
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// The prepare capability of one backend connection.
///
/// Implementations perform the `COM_STMT_PREPARE` round-trip against their
/// server. Callers must not hold any catalog lock across the call.
#[async_trait]
pub trait BackendConn: Send {
    /// Prepare `query` on this connection.
    async fn prepare_stmt(&mut self, query: &str) -> DriverResult<PreparedStmt>;
}
