use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap;
use std::any::{Any, TypeId};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::Notify;

use crate::config::WorkerConfig;
use crate::context::RequestContext;
use crate::core::request::{Request, RequestSource};
use crate::core::response::ResponseSink;
use crate::fault::{last_error, FaultHandler, FaultRenderer};
use crate::isolation::{Isolator, PurgeReport, RequestScope};
use crate::lifecycle::{Handler, Hooks, Lifecycle, NoHooks, State, Verdict};
use crate::middleware::cookies::{Cookie, CookieValidator};
use crate::session::{SessionBackend, SessionStore};

static PANIC_HOOK: Once = Once::new();

type ComponentFactory = Box<dyn Fn(&Request) -> Box<dyn Any + Send> + Send + Sync>;

///
/// The long-lived, read-only half of the application: configuration,
/// sessions, worker-lifetime components and the factories of
/// request-lifetime ones.
///
pub struct Application {
    config: WorkerConfig,
    sessions: SessionStore,
    validator: Option<CookieValidator>,
    factories: FnvHashMap<TypeId, ComponentFactory>,
    shared: FnvHashMap<TypeId, Box<dyn Any + Send + Sync>>,
    access_out: Mutex<Box<dyn Write + Send>>,
}

impl Application {
    pub fn new(config: WorkerConfig, backend: Arc<dyn SessionBackend>) -> Application {
        let sessions = SessionStore::new(&config.app_id, config.session.clone(), backend);
        let validator = config
            .cookie_validation_key
            .as_deref()
            .map(CookieValidator::new);

        Application {
            config,
            sessions,
            validator,
            factories: FnvHashMap::default(),
            shared: FnvHashMap::default(),
            access_out: Mutex::new(Box::new(io::stdout())),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.app_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn cookie_validator(&self) -> Option<&CookieValidator> {
        self.validator.as_ref()
    }

    ///
    /// Register a component that is built fresh for every request that asks
    /// for it and dropped when the request ends.
    ///
    pub fn with_request_component<T, F>(mut self, factory: F) -> Application
    where
        T: Any + Send,
        F: Fn(&Request) -> T + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Box::new(move |request| Box::new(factory(request)) as Box<dyn Any + Send>),
        );
        self
    }

    /// Register a component shared by all requests of the worker.
    pub fn with_shared<T: Any + Send + Sync>(mut self, component: T) -> Application {
        self.shared.insert(TypeId::of::<T>(), Box::new(component));
        self
    }

    pub fn with_access_writer<W: Write + Send + 'static>(self, writer: W) -> Application {
        match self.access_out.lock() {
            Ok(mut out) => *out = Box::new(writer),
            Err(poisoned) => *poisoned.into_inner() = Box::new(writer),
        }
        self
    }

    pub fn shared<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared
            .get(&TypeId::of::<T>())
            .and_then(|c| c.downcast_ref::<T>())
    }

    pub(crate) fn build_component(&self, id: &TypeId, request: &Request) -> Option<Box<dyn Any + Send>> {
        self.factories.get(id).map(|factory| factory(request))
    }

    pub(crate) fn write_access_line(&self, line: &str) {
        let mut out = match self.access_out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = write!(out, "{}\r\n", line).and_then(|_| out.flush()) {
            warn!("failed to write the access log: {}", e);
        }
    }
}

#[derive(Debug)]
pub struct Served {
    pub status: u16,
    pub exit_status: i32,
    pub verdict: Verdict,
    pub trace: Vec<State>,
    pub purge: PurgeReport,
}

///
/// Serves requests one after another, or interleaved on one runtime, for as
/// long as the process lives. Each request gets its own context and a
/// pristine scope from the pool; nothing it changes is visible to the next.
///
pub struct Worker {
    app: Arc<Application>,
    handler: Arc<dyn Handler>,
    hooks: Arc<dyn Hooks>,
    isolator: Isolator,
    faults: FaultHandler,
    scopes: Mutex<Vec<RequestScope>>,
    terminated: AtomicBool,
    termination: Notify,
    served: AtomicU64,
}

impl Worker {
    pub fn new<H: Handler + 'static>(app: Application, handler: H) -> Worker {
        let isolator = Isolator::new(&app.config().server_software)
            .with_validator(app.cookie_validator().cloned());
        let faults = FaultHandler::new(app.config());
        if app.config().record_panics {
            PANIC_HOOK.call_once(last_error::install_panic_hook);
        }

        Worker {
            app: Arc::new(app),
            handler: Arc::new(handler),
            hooks: Arc::new(NoHooks),
            isolator,
            faults,
            scopes: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            termination: Notify::new(),
            served: AtomicU64::new(0),
        }
    }

    pub fn with_hooks<K: Hooks + 'static>(mut self, hooks: K) -> Worker {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_renderer<R: FaultRenderer + 'static>(mut self, renderer: R) -> Worker {
        self.faults = self.faults.with_renderer(renderer);
        self
    }

    pub fn app(&self) -> &Application {
        &self.app
    }

    pub fn faults(&self) -> &FaultHandler {
        &self.faults
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stop the worker. Every later request is answered with 503.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.termination.notify_waiters();
    }

    /// Resolves once the worker has terminated.
    pub async fn terminated(&self) {
        loop {
            let notified = self.termination.notified();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// Number of idle scopes and whether every one of them is pristine.
    pub fn idle_scopes(&self) -> (usize, bool) {
        let scopes = match self.scopes.lock() {
            Ok(scopes) => scopes,
            Err(poisoned) => poisoned.into_inner(),
        };

        (scopes.len(), scopes.iter().all(RequestScope::is_pristine))
    }

    fn checkout(&self) -> RequestScope {
        let scope = match self.scopes.lock() {
            Ok(mut scopes) => scopes.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };

        scope.unwrap_or_default()
    }

    fn checkin(&self, scope: RequestScope) {
        if !scope.is_pristine() {
            error!("a request scope was not purged, dropping it");
            return;
        }

        match self.scopes.lock() {
            Ok(mut scopes) => scopes.push(scope),
            Err(poisoned) => poisoned.into_inner().push(scope),
        }
    }

    ///
    /// Run one request end to end: prime a scope, drive the lifecycle, purge
    /// the scope. A terminated worker only answers 503.
    ///
    pub async fn serve(&self, request: &Request, sink: &mut dyn ResponseSink) -> Served {
        if self.is_terminated() {
            if let Err(e) = unavailable(sink).await {
                error!("failed to refuse a request on a terminated worker: {}", e);
            }

            return Served {
                status: 503,
                exit_status: 1,
                verdict: Verdict::Terminate,
                trace: Vec::new(),
                purge: PurgeReport::default(),
            };
        }

        let mut scope = self.checkout();
        self.isolator.prime(request, &mut scope);

        let (status, run) = {
            let mut ctx = RequestContext::new(request, &self.app, &mut scope);
            let mut recorder = StatusRecorder { sink, sent: None };
            let run = Lifecycle::new(&*self.handler, &*self.hooks, &self.faults)
                .run(&mut ctx, &mut recorder)
                .await;

            (recorder.sent.unwrap_or_else(|| ctx.response.status_code()), run)
        };

        let purge = self.isolator.purge(&mut scope);
        self.checkin(scope);
        self.served.fetch_add(1, Ordering::SeqCst);

        if run.verdict == Verdict::Terminate {
            error!("worker is terminating after a fatal fault");
            self.terminate();
        }

        Served {
            status,
            exit_status: run.exit_status,
            verdict: run.verdict,
            trace: run.trace,
            purge,
        }
    }

    /// `serve` for anything a transport can turn into a `Request`.
    pub async fn serve_source<S>(&self, source: S, sink: &mut dyn ResponseSink) -> io::Result<Served>
    where
        S: RequestSource + Send,
    {
        let request = source.into_request().await?;

        Ok(self.serve(&request, sink).await)
    }
}

/// Passes everything through and remembers the status that went out.
struct StatusRecorder<'s> {
    sink: &'s mut dyn ResponseSink,
    sent: Option<u16>,
}

#[async_trait]
impl ResponseSink for StatusRecorder<'_> {
    async fn status(&mut self, code: u16) -> io::Result<()> {
        self.sent = Some(code);
        self.sink.status(code).await
    }

    async fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.sink.header(name, value).await
    }

    async fn cookie(&mut self, cookie: &Cookie) -> io::Result<()> {
        self.sink.cookie(cookie).await
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.sink.write(chunk).await
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> io::Result<()> {
        self.sink.end(chunk).await
    }
}

async fn unavailable(sink: &mut dyn ResponseSink) -> io::Result<()> {
    sink.status(503).await?;
    sink.header("Content-Type", "text/plain; charset=UTF-8").await?;
    sink.end(Some(Bytes::from_static(b"Service Unavailable"))).await
}
