use lazy_static::lazy_static;
use std::panic;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The process cannot safely continue.
    Fatal,
    /// Memory or another process resource ran out.
    Exhausted,
    Error,
    Warning,
    Notice,
}

impl Severity {
    pub fn is_fatal(self) -> bool {
        matches!(self, Severity::Fatal | Severity::Exhausted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastError {
    pub severity: Severity,
    pub message: String,
    pub location: Option<String>,
}

lazy_static! {
    static ref LAST_ERROR: Mutex<Option<LastError>> = Mutex::new(None);
}

///
/// Record the latest process-level error condition. A fatal record is never
/// replaced by a lesser one until it has been taken.
///
pub fn record(severity: Severity, message: &str, location: Option<String>) {
    let mut slot = match LAST_ERROR.lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(ref existing) = *slot {
        if existing.severity.is_fatal() && !severity.is_fatal() {
            return;
        }
    }

    *slot = Some(LastError {
        severity,
        message: message.to_owned(),
        location,
    });
}

/// Take and clear the recorded error.
pub fn take() -> Option<LastError> {
    match LAST_ERROR.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

pub fn peek() -> Option<LastError> {
    match LAST_ERROR.lock() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

///
/// Record a fatal condition and unwind. The worker's fault handler will see
/// the record and terminate the worker after answering the request.
///
pub fn raise_fatal(severity: Severity, message: &str) -> ! {
    record(severity, message, None);
    panic!("{}", message);
}

///
/// Install a panic hook that records every panic as an `Error`, then calls
/// the previous hook. `Worker::new` installs it once when `record_panics`
/// is set.
///
pub fn install_panic_hook() {
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        let message = crate::core::errors::panic_message(info.payload());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));

        record(Severity::Error, &message, location);
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    // The slot is process wide, so everything touching it lives in one test.
    #[test]
    fn it_should_keep_fatal_records_until_taken() {
        take();

        record(Severity::Warning, "deprecated call", None);
        assert_eq!(peek().map(|e| e.severity), Some(Severity::Warning));

        record(Severity::Exhausted, "allocation of 1 GiB failed", None);
        record(Severity::Error, "panic afterwards", None);

        let last = take().unwrap();
        assert!(last.severity.is_fatal());
        assert_eq!(last.message, "allocation of 1 GiB failed");
        assert!(take().is_none());
    }
}
