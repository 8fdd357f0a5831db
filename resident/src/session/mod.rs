pub mod backend;

#[cfg(feature = "redis_session")]
pub mod redis;

pub use self::backend::{MemoryBackend, SessionBackend};

use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::core::request::Request;
use crate::middleware::cookies::{Cookie, CookieOptions, CookieValidator, SameSite};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session backend failure: {0}")]
    Backend(String),
    #[error("failed to encode session document: {0}")]
    Encode(#[from] serde_json::Error),
    #[cfg(feature = "redis_session")]
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CookieParams {
    /// Seconds; `0` keeps the cookie for the browser session.
    pub lifetime: u64,
    pub path: String,
    pub domain: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

impl Default for CookieParams {
    fn default() -> CookieParams {
        CookieParams {
            lifetime: 0,
            path: "/".to_owned(),
            domain: "".to_owned(),
            secure: false,
            http_only: true,
            same_site: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie and query parameter carrying the session id.
    pub name: String,
    /// Session key holding the flash counters.
    pub flash_param: String,
    /// Document lifetime in the backend, in seconds.
    pub timeout: u64,
    /// Defaults to a hash of the application id.
    pub key_prefix: Option<String>,
    pub use_cookies: bool,
    pub use_only_cookies: bool,
    pub use_trans_sid: bool,
    pub cookie: CookieParams,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            name: "RESIDENTSESSID".to_owned(),
            flash_param: "__flash".to_owned(),
            timeout: 1440,
            key_prefix: None,
            use_cookies: true,
            use_only_cookies: true,
            use_trans_sid: false,
            cookie: CookieParams::default(),
        }
    }
}

///
/// First five hex digits of `sha256(app_id)`, used to namespace keys of
/// applications sharing one store.
///
pub fn key_prefix_for(app_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(app_id.as_bytes()));
    digest[..5].to_owned()
}

/// A fresh 128-bit session id as 32 hex characters.
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ',')
}

///
/// The worker-lifetime half of sessions: configuration plus the backend.
/// `begin` hands out the per-request `Session`.
///
pub struct SessionStore {
    config: Arc<SessionConfig>,
    backend: Arc<dyn SessionBackend>,
    key_prefix: String,
}

impl SessionStore {
    pub fn new(app_id: &str, config: SessionConfig, backend: Arc<dyn SessionBackend>) -> SessionStore {
        let key_prefix = config
            .key_prefix
            .clone()
            .unwrap_or_else(|| key_prefix_for(app_id));

        SessionStore {
            config: Arc::new(config),
            backend,
            key_prefix,
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    ///
    /// Start the session of one request. Nothing is read or minted until the
    /// session is first used.
    ///
    pub fn begin(&self, request: &Request, validator: Option<&CookieValidator>) -> Session {
        let name = self.config.name.as_str();

        let from_cookie = if self.config.use_cookies {
            request.cookie(name).and_then(|raw| match validator {
                Some(validator) => validator.validate(name, raw),
                None => Some(raw.to_owned()),
            })
        } else {
            None
        };
        let from_param = if !self.config.use_only_cookies && self.config.use_trans_sid {
            request.query_param(name).map(str::to_owned)
        } else {
            None
        };

        Session {
            config: self.config.clone(),
            backend: self.backend.clone(),
            key_prefix: self.key_prefix.clone(),
            candidate: from_cookie.or(from_param).filter(|id| is_valid_id(id)),
            id: None,
            state: SessionState::None,
            data: Map::new(),
            fresh: HashSet::new(),
            pending_cookie: None,
            load_failed: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Not loaded during this request.
    None,
    Active,
    /// Persisted or destroyed.
    Closed,
}

///
/// One request's session. The document is read from the backend on first
/// use, changed only in memory, and written back once by `persist`.
///
/// Flash values carry a counter under `flash_param`: `-1` is removed after
/// it has been read in a later request, `0` survives exactly one more
/// request, and a positive counter is removed the next time the session is
/// opened.
///
pub struct Session {
    config: Arc<SessionConfig>,
    backend: Arc<dyn SessionBackend>,
    key_prefix: String,
    candidate: Option<String>,
    id: Option<String>,
    state: SessionState,
    data: Map<String, Value>,
    // Flash keys set during this request. Reading them does not arm removal.
    fresh: HashSet<String>,
    pending_cookie: Option<Cookie>,
    load_failed: bool,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    ///
    /// The session id. Resolved once per request: the request's cookie or
    /// parameter when present, otherwise a freshly minted id whose cookie is
    /// queued for the response.
    ///
    pub fn id(&mut self) -> String {
        if let Some(ref id) = self.id {
            return id.clone();
        }

        let id = match self.candidate.take() {
            Some(id) => id,
            None => {
                let id = generate_id();
                self.queue_cookie(&id);
                id
            }
        };
        self.id = Some(id.clone());

        id
    }

    /// The `Set-Cookie` the session needs sent, if any.
    pub fn take_cookie(&mut self) -> Option<Cookie> {
        self.pending_cookie.take()
    }

    fn queue_cookie(&mut self, value: &str) {
        if !self.config.use_cookies {
            return;
        }

        let params = &self.config.cookie;
        let expires = if params.lifetime > 0 {
            chrono::Utc::now().timestamp() + params.lifetime as i64
        } else {
            0
        };
        let same_site = match params.same_site.as_deref() {
            Some("Strict") | Some("strict") => Some(SameSite::Strict),
            Some("Lax") | Some("lax") => Some(SameSite::Lax),
            Some("None") | Some("none") => Some(SameSite::None),
            _ => None,
        };

        self.pending_cookie = Some(Cookie::new(
            &self.config.name,
            value,
            CookieOptions {
                domain: params.domain.clone(),
                path: params.path.clone(),
                expires,
                http_only: params.http_only,
                max_age: 0,
                secure: params.secure,
                same_site,
            },
        ));
    }

    fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    ///
    /// Load the document if this request has not done so yet. A missing or
    /// unreadable document opens as an empty session.
    ///
    pub async fn open(&mut self) {
        if self.state == SessionState::Active {
            return;
        }

        let id = self.id();
        let key = self.key_for(&id);

        self.data = match self.backend.read(&key).await {
            Ok(Some(raw)) if raw.is_empty() => Map::new(),
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!("discarding unreadable session document {}", key);
                    Map::new()
                }
            },
            Ok(None) => Map::new(),
            Err(e) => {
                error!("failed to read session {}: {}", key, e);
                self.load_failed = true;
                Map::new()
            }
        };
        self.state = SessionState::Active;

        debug!("session {} started", id);

        self.update_flash_counters();
    }

    fn update_flash_counters(&mut self) {
        let counters = match self.data.remove(&self.config.flash_param) {
            Some(Value::Object(counters)) => counters,
            Some(_) => {
                warn!("flash counters were not a map, dropping them");
                return;
            }
            None => return,
        };

        let mut kept = Map::new();
        for (key, count) in counters {
            let count = count.as_i64().unwrap_or(1);

            if count > 0 {
                self.data.remove(&key);
            } else if count == 0 {
                kept.insert(key, Value::from(1));
            } else {
                kept.insert(key, Value::from(count));
            }
        }

        self.store_counters(kept);
    }

    fn take_counters(&mut self) -> Map<String, Value> {
        match self.data.remove(&self.config.flash_param) {
            Some(Value::Object(counters)) => counters,
            _ => Map::new(),
        }
    }

    fn store_counters(&mut self, counters: Map<String, Value>) {
        self.data
            .insert(self.config.flash_param.clone(), Value::Object(counters));
    }

    fn counter(&self, key: &str) -> Option<i64> {
        self.data
            .get(&self.config.flash_param)
            .and_then(Value::as_object)
            .and_then(|counters| counters.get(key))
            .map(|count| count.as_i64().unwrap_or(1))
    }

    fn set_counter(&mut self, key: &str, count: i64) {
        let mut counters = self.take_counters();
        counters.insert(key.to_owned(), Value::from(count));
        self.store_counters(counters);
    }

    pub async fn get(&mut self, key: &str) -> Option<Value> {
        self.open().await;
        self.data.get(key).cloned()
    }

    pub async fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        self.get(key)
            .await
            .and_then(|value| serde_json::from_value(value).ok())
    }

    pub async fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.open().await;
        self.data.insert(key.to_owned(), value.into());
    }

    pub async fn remove(&mut self, key: &str) -> Option<Value> {
        self.open().await;
        self.data.remove(key)
    }

    pub async fn remove_all(&mut self) {
        self.open().await;
        self.data.clear();
        self.fresh.clear();
    }

    pub async fn has(&mut self, key: &str) -> bool {
        self.open().await;
        self.data.contains_key(key)
    }

    pub async fn count(&mut self) -> usize {
        self.open().await;
        self.data.len()
    }

    ///
    /// Store a flash value. With `remove_after_access` it lives until it has
    /// been read in a later request; without, it lives through exactly one
    /// more request.
    ///
    pub async fn set_flash(&mut self, key: &str, value: impl Into<Value>, remove_after_access: bool) {
        self.open().await;

        self.set_counter(key, if remove_after_access { -1 } else { 0 });
        self.data.insert(key.to_owned(), value.into());
        self.fresh.insert(key.to_owned());
    }

    /// Append to a flash list, turning an existing scalar into a list.
    pub async fn add_flash(&mut self, key: &str, value: impl Into<Value>, remove_after_access: bool) {
        self.open().await;

        self.set_counter(key, if remove_after_access { -1 } else { 0 });
        let value = value.into();
        let list = match self.data.remove(key) {
            None | Some(Value::Null) => vec![value],
            Some(Value::Array(mut list)) => {
                list.push(value);
                list
            }
            Some(existing) => vec![existing, value],
        };
        self.data.insert(key.to_owned(), Value::Array(list));
        self.fresh.insert(key.to_owned());
    }

    ///
    /// Read a flash value. `delete` removes it immediately; otherwise a value
    /// set in an earlier request is marked for removal at the next open.
    ///
    pub async fn get_flash(&mut self, key: &str, default: Option<Value>, delete: bool) -> Option<Value> {
        self.open().await;

        let count = match self.counter(key) {
            Some(count) => count,
            None => return default,
        };
        let value = self.data.get(key).cloned().or(default);

        if delete {
            self.forget_flash(key);
        } else if count < 0 && !self.fresh.contains(key) {
            self.set_counter(key, 1);
        }

        value
    }

    pub async fn get_all_flashes(&mut self, delete: bool) -> Map<String, Value> {
        self.open().await;

        let counters = self.take_counters();
        let mut kept = Map::new();
        let mut flashes = Map::new();

        for (key, count) in counters {
            let value = match self.data.get(&key) {
                Some(value) => value.clone(),
                None => continue,
            };
            flashes.insert(key.clone(), value);

            if delete {
                self.data.remove(&key);
                self.fresh.remove(&key);
            } else if count.as_i64().unwrap_or(1) < 0 && !self.fresh.contains(&key) {
                kept.insert(key, Value::from(1));
            } else {
                kept.insert(key, count);
            }
        }

        self.store_counters(kept);
        flashes
    }

    pub async fn has_flash(&mut self, key: &str) -> bool {
        self.get_flash(key, None, false).await.is_some()
    }

    pub async fn remove_flash(&mut self, key: &str) -> Option<Value> {
        self.open().await;
        self.forget_flash(key)
    }

    fn forget_flash(&mut self, key: &str) -> Option<Value> {
        let mut counters = self.take_counters();
        let known = counters.remove(key).is_some();
        self.store_counters(counters);
        self.fresh.remove(key);

        if known {
            self.data.remove(key)
        } else {
            None
        }
    }

    pub async fn remove_all_flashes(&mut self) {
        self.open().await;

        for (key, _) in self.take_counters() {
            self.data.remove(&key);
        }
        self.fresh.clear();
        self.store_counters(Map::new());
    }

    ///
    /// Move the session to a new id, optionally deleting the old document.
    ///
    pub async fn regenerate_id(&mut self, delete_old: bool) -> Result<(), SessionError> {
        self.open().await;

        let old = self.id();
        if delete_old {
            self.backend.destroy(&self.key_for(&old)).await?;
        }

        let id = generate_id();
        self.queue_cookie(&id);
        self.id = Some(id);

        Ok(())
    }

    /// Delete the document and expire the cookie. Nothing is persisted after.
    pub async fn destroy(&mut self) -> Result<(), SessionError> {
        if let Some(id) = self.id.take().or_else(|| self.candidate.take()) {
            let key = self.key_for(&id);
            self.backend.destroy(&key).await?;
            if self.config.use_cookies {
                let mut cookie = Cookie::new(&self.config.name, "", CookieOptions::default());
                cookie.options.path = self.config.cookie.path.clone();
                cookie.options.domain = self.config.cookie.domain.clone();
                cookie.options.expires = 1;
                self.pending_cookie = Some(cookie);
            }
        }

        self.data.clear();
        self.fresh.clear();
        self.state = SessionState::Closed;

        Ok(())
    }

    ///
    /// Write the document back in a single backend write and close the
    /// backend. Sessions not opened during this request are left alone.
    /// Returns whether a write happened.
    ///
    pub async fn persist(&mut self) -> Result<bool, SessionError> {
        if self.state != SessionState::Active {
            return Ok(false);
        }
        self.state = SessionState::Closed;

        if self.load_failed {
            warn!("session could not be loaded, leaving the stored copy untouched");
            self.backend.close().await?;
            return Ok(false);
        }

        let id = self.id();
        let key = self.key_for(&id);
        let document = serde_json::to_string(&self.data)?;

        let written = self.backend.write(&key, &document, self.config.timeout).await;
        let closed = self.backend.close().await;
        written?;
        closed?;

        Ok(true)
    }

    pub async fn close(&mut self) -> Result<bool, SessionError> {
        self.persist().await
    }
}
