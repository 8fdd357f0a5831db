pub mod classify;
pub mod command;
pub mod error;
pub mod pool;

pub use self::classify::ConnectionErrorSignatures;
pub use self::command::Command;
pub use self::error::{DbError, ErrorInfo};
pub use self::pool::{Pool, PooledConnection};

use async_trait::async_trait;
use serde_derive::Deserialize;
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub signatures: ConnectionErrorSignatures,
}

/// Which physical server a statement is prepared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Primary,
    Replica,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Each row as a column name to value map.
    pub fn into_maps(self) -> Vec<Map<String, Value>> {
        let columns = self.columns;

        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

///
/// A prepared statement bound to the connection that prepared it.
///
#[async_trait]
pub trait Statement: Send {
    async fn execute(&mut self, params: &[Value]) -> Result<u64, DbError>;
    async fn query(&mut self, params: &[Value]) -> Result<Rows, DbError>;

    /// The driver's view of the last failure, if any.
    fn error_info(&self) -> Option<ErrorInfo> {
        None
    }
}

///
/// A persistent database connection, possibly fronting a primary and one or
/// more replicas.
///
#[async_trait]
pub trait Connection: Send {
    async fn open(&mut self) -> Result<(), DbError>;
    async fn close(&mut self);
    fn in_transaction(&self) -> bool;
    async fn prepare(&mut self, sql: &str, endpoint: Endpoint) -> Result<Box<dyn Statement>, DbError>;

    fn is_read_query(&self, sql: &str) -> bool {
        let head = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        matches!(head.as_str(), "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN")
    }

    /// Drop any cached schema metadata for `table`.
    async fn refresh_table_schema(&mut self, _table: &str) {}
}
