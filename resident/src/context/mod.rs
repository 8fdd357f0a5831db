pub mod request_log;

pub use self::request_log::{LogEntry, RequestLog};

use bytes::Bytes;
use std::any::{Any, TypeId};

use crate::config::WorkerConfig;
use crate::core::errors::Fault;
use crate::core::request::Request;
use crate::core::response::Response;
use crate::fault::access_log;
use crate::isolation::{Ambient, RequestScope, RouteState, WidgetStack};
use crate::middleware::cookies::{Cookie, CookieOptions};
use crate::session::Session;
use crate::worker::Application;

/// A `Context` is what handlers write their answer to. A new one is made for
/// each incoming request and dropped when the request is done.
pub trait Context {
    fn route(&self) -> &str;
    fn set(&mut self, key: &str, value: &str);
    fn remove(&mut self, key: &str);
    fn set_body(&mut self, body: Vec<u8>);
    fn set_body_bytes(&mut self, bytes: Bytes);
    fn status(&mut self, code: u16);
}

///
/// Everything one request can see and change, passed explicitly to hooks
/// and handlers. Nothing here outlives the request except what
/// `Application` already owns.
///
pub struct RequestContext<'r> {
    pub request: &'r Request,
    pub app: &'r Application,
    pub response: Response,
    pub session: Session,
    pub log: RequestLog,
    pub scope: &'r mut RequestScope,
    /// Exit status of the request, set by an early exit.
    pub exit_status: i32,
}

impl<'r> RequestContext<'r> {
    pub fn new(request: &'r Request, app: &'r Application, scope: &'r mut RequestScope) -> RequestContext<'r> {
        let mut response = Response::new();
        if let Some(validator) = app.cookie_validator() {
            response.sign_cookies_with(validator.clone());
        }
        let session = app.sessions().begin(request, app.cookie_validator());

        RequestContext {
            request,
            app,
            response,
            session,
            log: RequestLog::new(),
            scope,
            exit_status: 0,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        self.app.config()
    }

    pub fn ambient(&self) -> &Ambient {
        &self.scope.ambient
    }

    pub fn route_state(&mut self) -> &mut RouteState {
        &mut self.scope.route
    }

    pub fn widgets(&mut self) -> &mut WidgetStack {
        &mut self.scope.widgets
    }

    ///
    /// The request-lifetime instance of `T`, built on first use from the
    /// factory registered on the application.
    ///
    pub fn component<T: Any + Send>(&mut self) -> Option<&mut T> {
        if !self.scope.components.contains::<T>() {
            let built = self.app.build_component(&TypeId::of::<T>(), self.request)?;
            self.scope.components.insert_boxed(TypeId::of::<T>(), built);
        }

        self.scope
            .components
            .get_boxed_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    /// A worker-lifetime component shared by every request.
    pub fn shared<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.app.shared::<T>()
    }

    pub fn on<F>(&mut self, event: &str, listener: F)
    where
        F: Fn(&crate::isolation::Event) + Send + Sync + 'static,
    {
        self.scope.events.on(event, listener);
    }

    pub fn trigger(&self, event: &str, data: serde_json::Value) -> usize {
        self.scope.events.trigger(event, data)
    }

    ///
    /// Set the body as a string
    ///
    pub fn body(&mut self, body_string: &str) {
        self.response.body(body_string);
    }

    ///
    /// Set the response `Content-Type`. A shortcode for
    ///
    /// ```ignore
    /// ctx.set("Content-Type", "some-val");
    /// ```
    ///
    pub fn content_type(&mut self, c_type: &str) {
        self.set("Content-Type", c_type);
    }

    ///
    /// Set up a redirect, will default to 302, but can be changed after
    /// the fact.
    ///
    pub fn redirect(&mut self, destination: &str) {
        self.response.redirect(self.request, destination, 302);
    }

    ///
    /// Sets a cookie on the response
    ///
    pub fn cookie(&mut self, name: &str, value: &str, options: &CookieOptions) {
        self.response.cookie(Cookie::new(name, value, options.clone()));
    }

    ///
    /// The built-in half of post-dispatch: persist the session, attach its
    /// cookie, flush the request log and write the debug access line.
    ///
    pub(crate) async fn finish_request(&mut self) -> Result<(), Fault> {
        let persisted = self.session.persist().await;
        if let Some(cookie) = self.session.take_cookie() {
            self.response.cookie(cookie);
        }

        if let Err(ref e) = persisted {
            self.log.error("session", &format!("failed to persist the session: {}", e));
        }
        self.log.flush();

        let config = self.app.config();
        if config.debug && config.access_log {
            let line = access_log::access_line(
                self.request,
                self.response.status_code(),
                access_log::current_memory_mb(),
                chrono::Local::now(),
            );
            self.app.write_access_line(&line);
        }

        persisted.map(|_| ()).map_err(Fault::from)
    }
}

impl<'r> Context for RequestContext<'r> {
    fn route(&self) -> &str {
        self.request.path()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.response.set(key, value);
    }

    fn remove(&mut self, key: &str) {
        self.response.remove(key);
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.response.set_body_bytes(Bytes::from(body));
    }

    fn set_body_bytes(&mut self, bytes: Bytes) {
        self.response.set_body_bytes(bytes);
    }

    fn status(&mut self, code: u16) {
        self.response.status(code);
    }
}
