use log::Level;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub category: String,
    pub message: String,
}

///
/// Messages logged while handling a request. They are held back and written
/// through the `log` facade on `flush`, which runs after dispatch.
///
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Vec<LogEntry>,
    flushed: usize,
}

impl RequestLog {
    pub fn new() -> RequestLog {
        RequestLog::default()
    }

    pub fn push(&mut self, level: Level, category: &str, message: &str) {
        self.entries.push(LogEntry {
            level,
            category: category.to_owned(),
            message: message.to_owned(),
        });
    }

    pub fn debug(&mut self, category: &str, message: &str) {
        self.push(Level::Debug, category, message);
    }

    pub fn info(&mut self, category: &str, message: &str) {
        self.push(Level::Info, category, message);
    }

    pub fn warning(&mut self, category: &str, message: &str) {
        self.push(Level::Warn, category, message);
    }

    pub fn error(&mut self, category: &str, message: &str) {
        self.push(Level::Error, category, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of entries written out so far.
    pub fn flushed(&self) -> usize {
        self.flushed
    }

    /// Write every pending entry, returning how many were written.
    pub fn flush(&mut self) -> usize {
        let count = self.entries.len();

        for entry in self.entries.drain(..) {
            log!(target: "resident::app", entry.level, "[{}] {}", entry.category, entry.message);
        }
        self.flushed += count;

        count
    }
}
