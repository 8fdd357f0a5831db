use thiserror::Error;

///
/// What the driver reported about the last failure of a statement:
/// `(SQLSTATE, driver code, driver message)`.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub sql_state: String,
    pub code: Option<i64>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLSTATE[{}]: {}", .0.sql_state, .0.message)]
    Driver(ErrorInfo),
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("failed to prepare SQL: {sql}: {message}")]
    Prepare { sql: String, message: String },
    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn driver(code: i64, message: &str) -> DbError {
        DbError::Driver(ErrorInfo {
            sql_state: "HY000".to_owned(),
            code: Some(code),
            message: message.to_owned(),
        })
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            DbError::Driver(info) => info.code,
            _ => None,
        }
    }
}
