use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

pub type Cause = Box<dyn StdError + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Business logic or framework failure. Rendered, logged, and the worker carries on.
    Application,
    /// An HTTP-level refusal (404, 416, ...) raised on purpose by the application.
    Http,
    /// A panic or similar process-level condition caught at the controller boundary.
    Panic,
}

///
/// A `Fault` is the failure half of a handler `Outcome`. It carries the
/// status to answer with, a message for the logs, and optionally the error
/// that caused it.
///
pub struct Fault {
    pub kind: FaultKind,
    pub status: Option<u16>,
    pub message: String,
    pub cause: Option<Cause>,
    backtrace: Backtrace,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Fault {
        Fault {
            kind,
            status: None,
            message: message.into(),
            cause: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn application(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::Application, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::Http, message).with_status(status)
    }

    pub fn with_status(mut self, status: u16) -> Fault {
        self.status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Fault {
        self.cause = Some(cause.into());
        self
    }

    /// Builds a fault out of a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Fault {
        let message = panic_message(payload);

        Fault::new(FaultKind::Panic, format!("panic: {}", message)).with_status(500)
    }

    ///
    /// The status code the response should carry. Faults without an explicit
    /// code answer 500.
    ///
    pub fn status_code(&self) -> u16 {
        match self.status {
            Some(code) if (100..=999).contains(&code) => code,
            _ => 500,
        }
    }

    pub fn name(&self) -> String {
        match self.kind {
            FaultKind::Http => http::StatusCode::from_u16(self.status_code())
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Error")
                .to_owned(),
            FaultKind::Panic => "Panic".to_owned(),
            FaultKind::Application => "Application Error".to_owned(),
        }
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The message followed by every `source()` in the cause chain.
    pub fn chain(&self) -> Vec<String> {
        let mut lines = vec![self.message.clone()];
        let mut next: Option<&(dyn StdError + 'static)> = match self.cause {
            Some(ref cause) => Some(cause.as_ref()),
            None => None,
        };

        while let Some(err) = next {
            lines.push(err.to_string());
            next = err.source();
        }

        lines
    }
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

pub trait FaultSet {
    fn parsing_error(error: &str) -> Fault;
    fn generic_error() -> Fault;
    fn unauthorized_error() -> Fault;
    fn not_found_error() -> Fault;
    fn range_not_satisfiable_error() -> Fault;
    fn internal_error(message: &str) -> Fault;
}

impl FaultSet for Fault {
    fn parsing_error(error: &str) -> Fault {
        Fault::http(400, format!("Failed to parse '{}'", error))
    }

    fn generic_error() -> Fault {
        Fault::http(400, "Something didn't work!")
    }

    fn unauthorized_error() -> Fault {
        Fault::http(401, "Unauthorized")
    }

    fn not_found_error() -> Fault {
        Fault::http(404, "Not found")
    }

    fn range_not_satisfiable_error() -> Fault {
        Fault::http(416, "Requested range not satisfiable.")
    }

    fn internal_error(message: &str) -> Fault {
        Fault::application(message).with_status(500)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.status_code(), self.message)
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for Fault {
    fn from(e: E) -> Self {
        Fault::application(e.to_string()).with_cause(e)
    }
}
