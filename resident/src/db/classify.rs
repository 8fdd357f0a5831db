use serde_derive::Deserialize;

use crate::db::error::{DbError, ErrorInfo};

///
/// Signatures of a severed or timed out connection. `2006` is "server has
/// gone away", `70100` a query killed by the server, and the message covers
/// a write that failed mid-flight.
///
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionErrorSignatures {
    pub codes: Vec<i64>,
    pub messages: Vec<String>,
}

impl Default for ConnectionErrorSignatures {
    fn default() -> ConnectionErrorSignatures {
        ConnectionErrorSignatures {
            codes: vec![2006, 70100],
            messages: vec!["Error while sending QUERY packet. PID=".to_owned()],
        }
    }
}

impl ConnectionErrorSignatures {
    ///
    /// Whether `error` means the connection is gone. `info` is the statement's
    /// own error info, which carries the driver code when `error` does not.
    ///
    pub fn is_transient(&self, error: &DbError, info: Option<&ErrorInfo>) -> bool {
        let code = error.code().or_else(|| info.and_then(|i| i.code));
        if let Some(code) = code {
            if self.codes.contains(&code) {
                return true;
            }
        }

        let message = error.to_string();
        self.messages.iter().any(|m| message.contains(m.as_str()))
    }
}
