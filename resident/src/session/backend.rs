use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::session::SessionError;

///
/// The external keyed store session documents live in. Keys arrive already
/// namespaced; documents are opaque serialized blobs.
///
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, SessionError>;
    async fn write(&self, key: &str, data: &str, ttl: u64) -> Result<(), SessionError>;
    async fn destroy(&self, key: &str) -> Result<(), SessionError>;

    /// Called once a request is done with the backend.
    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct Entry {
    data: String,
    expires_at: Option<Instant>,
}

///
/// An in-process backend for tests and single-worker deployments.
///
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Store a raw document, bypassing the session layer.
    pub fn insert_raw(&self, key: &str, data: &str) {
        self.entries.insert(
            key.to_owned(),
            Entry {
                data: data.to_owned(),
                expires_at: None,
            },
        );
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.data.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, SessionError> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(at) if at <= Instant::now() => true,
                _ => return Ok(Some(entry.data.clone())),
            },
            None => return Ok(None),
        };

        if expired {
            self.entries.remove(key);
        }

        Ok(None)
    }

    async fn write(&self, key: &str, data: &str, ttl: u64) -> Result<(), SessionError> {
        let expires_at = if ttl > 0 {
            Some(Instant::now() + Duration::from_secs(ttl))
        } else {
            None
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            key.to_owned(),
            Entry {
                data: data.to_owned(),
                expires_at,
            },
        );

        Ok(())
    }

    async fn destroy(&self, key: &str) -> Result<(), SessionError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_should_forget_expired_documents() {
        let backend = MemoryBackend::new();

        backend.write("k", "{}", 1).await.unwrap();
        assert_eq!(backend.read("k").await.unwrap(), Some("{}".to_owned()));

        std::thread::sleep(Duration::from_millis(1100));

        assert_eq!(backend.read("k").await.unwrap(), None);
        assert!(backend.is_empty());
    }
}
