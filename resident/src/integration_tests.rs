use async_trait::async_trait;
use lazy_static::lazy_static;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Runtime;

use resident::fault::last_error::{self, Severity};
use resident::fault::{FaultRenderer, RenderError};
use resident::testing::{self, RecordingSink};
use resident::{
    outcome_try, Application, Fault, FileOptions, Handler, Hooks, MemoryBackend, Outcome, Request,
    RequestContext, Response, State, Verdict, Worker, WorkerConfig,
};

lazy_static! {
    // Panics and fatal records go through a process-wide slot.
    static ref PANIC_LOCK: Mutex<()> = Mutex::new(());
}

fn panic_lock() -> MutexGuard<'static, ()> {
    PANIC_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

struct Visits(u32);

struct Download(PathBuf);

struct Site;

#[async_trait]
impl Handler for Site {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Outcome {
        match ctx.request.path() {
            "/remember" => {
                ctx.route_state().controller = Some("site".to_owned());
                ctx.widgets().begin("nav");
                ctx.on("saved", |_| {});
                if let Some(visits) = ctx.component::<Visits>() {
                    visits.0 += 1;
                }
                ctx.session.set("user", "jo").await;
                ctx.body("remembered");
            }
            "/inspect" => {
                let listeners = ctx.scope.events.listener_count();
                let components = ctx.scope.components.len();
                let controller = ctx.route_state().controller.clone();
                let widgets = ctx.widgets().counter();
                let header = ctx.ambient().server_var("HTTP_X_USER").map(str::to_owned);
                let user = ctx.session.get("user").await;

                ctx.body(&format!(
                    "listeners={} components={} controller={:?} widgets={} user={:?} header={:?}",
                    listeners, components, controller, widgets, user, header
                ));
            }
            "/slow" => {
                let name = ctx.request.query_param("name").unwrap_or("").to_owned();
                ctx.route_state().action = Some(name);
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                let action = ctx.route_state().action.clone().unwrap_or_default();
                ctx.body(&action);
            }
            "/flash/set" => {
                ctx.session.set_flash("notice", "saved", true).await;
                let same_request = ctx.session.get_flash("notice", None, false).await;
                ctx.body(&format!("{:?}", same_request));
            }
            "/flash/show" => {
                let notice = ctx.session.get_flash("notice", None, false).await;
                ctx.body(&format!("{:?}", notice));
            }
            "/exit" => {
                ctx.session.set("visited", true).await;
                ctx.body("leaving early");
                return Outcome::exit(3);
            }
            "/exit/replace" => {
                let mut replacement = Response::new();
                replacement.status(202);
                replacement.body("replaced");
                return Outcome::exit_with(0, replacement);
            }
            "/exit/session" => {
                ctx.session.set("user", "jo").await;
                let mut farewell = Response::new();
                farewell.body("bye");
                return Outcome::exit_with(0, farewell);
            }
            "/missing" => return Outcome::fail(Fault::http(404, "no such page")),
            "/panic" => panic!("handler blew up"),
            "/fatal" => last_error::raise_fatal(Severity::Exhausted, "allowed memory size exhausted"),
            "/download" => {
                let path = match ctx.shared::<Download>() {
                    Some(download) => download.0.clone(),
                    None => return Outcome::fail(Fault::application("no download configured")),
                };
                outcome_try!(
                    ctx.response
                        .send_file(ctx.request, &path, Some("data.bin"), &FileOptions::default())
                        .await
                );
            }
            _ => ctx.body("index"),
        }

        Outcome::Continue
    }
}

#[derive(Clone, Default)]
struct CountingHooks {
    after: Arc<AtomicUsize>,
}

#[async_trait]
impl Hooks for CountingHooks {
    async fn before_request(&self, ctx: &mut RequestContext<'_>) -> Outcome {
        if ctx.request.path() == "/hook/before" {
            return Outcome::fail(Fault::application("before hook refused"));
        }
        Outcome::Continue
    }

    async fn after_request(&self, ctx: &mut RequestContext<'_>) -> Result<(), Fault> {
        self.after.fetch_add(1, Ordering::SeqCst);
        if ctx.request.path() == "/hook/after" {
            return Err(Fault::application("after hook refused"));
        }
        Ok(())
    }
}

struct BrokenRenderer;

impl FaultRenderer for BrokenRenderer {
    fn render(&self, _: &Fault, _: &Request, _: bool, response: &mut Response) -> Result<(), RenderError> {
        response.body("half an error page");
        Err(RenderError::Template("missing error view".to_owned()))
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn worker_with(config: WorkerConfig, backend: Arc<MemoryBackend>) -> Worker {
    let _ = env_logger::builder().is_test(true).try_init();

    let app = Application::new(config, backend)
        .with_request_component(|_| Visits(0))
        .with_access_writer(std::io::sink());

    Worker::new(app, Site)
}

fn worker() -> (Worker, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());

    (worker_with(WorkerConfig::default(), backend.clone()), backend)
}

#[tokio::test]
async fn it_should_not_leak_request_state_into_the_next_request() {
    let (worker, _) = worker();

    let first = testing::request(&worker, "GET", "/remember", &[("X-User", "jo")], "").await;
    let second = testing::get(&worker, "/inspect").await;

    assert_eq!(first.body(), "remembered");
    assert_eq!(first.served.purge.listeners, 1);
    assert_eq!(first.served.purge.components, 1);
    assert!(first.served.purge.route);
    assert!(first.served.purge.widgets);
    assert_eq!(
        second.body(),
        "listeners=0 components=0 controller=None widgets=0 user=None header=None"
    );
    assert_eq!(worker.idle_scopes(), (1, true));
}

#[tokio::test]
async fn it_should_see_its_session_again_with_the_cookie() {
    let (worker, _) = worker();

    let first = testing::request(&worker, "GET", "/remember", &[("X-User", "jo")], "").await;
    let cookie = first.cookie_header();
    let second = testing::request(&worker, "GET", "/inspect", &[("Cookie", cookie.as_str()), ("X-User", "al")], "").await;

    assert!(cookie.starts_with("RESIDENTSESSID="));
    assert!(second.body().contains("user=Some(String(\"jo\"))"));
    assert!(second.body().contains("header=Some(\"al\")"));
}

#[tokio::test]
async fn it_should_keep_interleaved_requests_apart() {
    let (worker, _) = worker();

    let (a, b) = tokio::join!(
        testing::get(&worker, "/slow?name=alpha"),
        testing::get(&worker, "/slow?name=beta")
    );

    assert_eq!(a.body(), "alpha");
    assert_eq!(b.body(), "beta");
    assert_eq!(worker.idle_scopes(), (2, true));
}

#[tokio::test]
async fn it_should_run_every_phase_in_order() {
    let (worker, _) = worker();

    let response = testing::get(&worker, "/").await;

    assert_eq!(response.status(), Some(200));
    assert_eq!(
        response.served.trace,
        vec![
            State::BeforeRequest,
            State::HandlingRequest,
            State::AfterRequest,
            State::SendingResponse,
            State::End
        ]
    );
    assert_eq!(response.served.exit_status, 0);
    assert_eq!(response.sink.ends, 1);
}

#[tokio::test]
async fn it_should_send_once_and_finish_once_whichever_phase_fails() {
    let hooks = CountingHooks::default();
    let backend = Arc::new(MemoryBackend::new());
    let worker = worker_with(WorkerConfig::default(), backend).with_hooks(hooks.clone());

    for (path, status) in &[("/hook/before", 500), ("/missing", 404), ("/hook/after", 500)] {
        hooks.after.store(0, Ordering::SeqCst);

        let response = testing::get(&worker, path).await;

        assert_eq!(response.status(), Some(*status), "status for {}", path);
        assert_eq!(response.sink.ends, 1, "sends for {}", path);
        assert_eq!(hooks.after.load(Ordering::SeqCst), 1, "after hooks for {}", path);
        assert_eq!(response.served.exit_status, 1);
        assert_eq!(response.served.verdict, Verdict::Continue);
        assert_eq!(response.served.trace.last(), Some(&State::End));
    }
}

#[tokio::test]
async fn it_should_fall_back_when_the_error_page_cannot_render() {
    let hooks = CountingHooks::default();
    let backend = Arc::new(MemoryBackend::new());
    let worker = worker_with(WorkerConfig::default(), backend)
        .with_hooks(hooks.clone())
        .with_renderer(BrokenRenderer);

    let response = testing::get(&worker, "/missing").await;

    assert_eq!(response.status(), Some(500));
    assert_eq!(response.served.status, 500);
    assert_eq!(response.sink.ends, 1);
    assert_eq!(response.body(), resident::fault::GENERIC_MESSAGE);
    assert_eq!(hooks.after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn it_should_show_the_error_chain_in_debug_fallbacks() {
    let backend = Arc::new(MemoryBackend::new());
    let config = WorkerConfig {
        debug: true,
        access_log: false,
        ..WorkerConfig::default()
    };
    let worker = worker_with(config, backend).with_renderer(BrokenRenderer);

    let response = testing::get(&worker, "/missing").await;

    assert!(response.body().starts_with("<pre>An error occurred while handling another error:"));
    assert!(response.body().contains("missing error view"));
}

#[tokio::test]
async fn it_should_carry_a_flash_into_the_next_request_only() {
    let (worker, _) = worker();

    let set = testing::get(&worker, "/flash/set").await;
    let cookie = set.cookie_header();
    let shown = testing::request(&worker, "GET", "/flash/show", &[("Cookie", cookie.as_str())], "").await;
    let gone = testing::request(&worker, "GET", "/flash/show", &[("Cookie", cookie.as_str())], "").await;

    assert_eq!(set.body(), "Some(String(\"saved\"))");
    assert_eq!(shown.body(), "Some(String(\"saved\"))");
    assert_eq!(gone.body(), "None");
}

fn signing_worker() -> Worker {
    let config = WorkerConfig {
        cookie_validation_key: Some("secret".to_owned()),
        ..WorkerConfig::default()
    };

    worker_with(config, Arc::new(MemoryBackend::new()))
}

#[tokio::test]
async fn it_should_keep_a_signed_session_across_requests() {
    let worker = signing_worker();
    let validator = resident::middleware::cookies::CookieValidator::new("secret");

    let first = testing::get(&worker, "/remember").await;
    let sent = first.sink.cookie("RESIDENTSESSID").unwrap();
    assert!(validator.validate("RESIDENTSESSID", &sent.value).is_some());

    let cookie = first.cookie_header();
    let second = testing::request(&worker, "GET", "/inspect", &[("Cookie", cookie.as_str())], "").await;
    assert!(second.body().contains("user=Some(String(\"jo\"))"));

    let forged = format!("RESIDENTSESSID={}", validator.validate("RESIDENTSESSID", &sent.value).unwrap());
    let third = testing::request(&worker, "GET", "/inspect", &[("Cookie", forged.as_str())], "").await;
    assert!(third.body().contains("user=None"));
}

#[tokio::test]
async fn it_should_sign_the_session_cookie_of_a_replacement_response() {
    let worker = signing_worker();
    let validator = resident::middleware::cookies::CookieValidator::new("secret");

    let first = testing::get(&worker, "/exit/session").await;
    assert_eq!(first.body(), "bye");
    let sent = first.sink.cookie("RESIDENTSESSID").unwrap();
    assert!(validator.validate("RESIDENTSESSID", &sent.value).is_some());

    let cookie = first.cookie_header();
    let second = testing::request(&worker, "GET", "/inspect", &[("Cookie", cookie.as_str())], "").await;
    assert!(second.body().contains("user=Some(String(\"jo\"))"));
}

#[tokio::test]
async fn it_should_persist_and_send_on_an_early_exit() {
    let hooks = CountingHooks::default();
    let backend = Arc::new(MemoryBackend::new());
    let worker = worker_with(WorkerConfig::default(), backend.clone()).with_hooks(hooks.clone());

    let response = testing::get(&worker, "/exit").await;

    assert_eq!(response.served.exit_status, 3);
    assert_eq!(response.status(), Some(200));
    assert_eq!(response.body(), "leaving early");
    assert_eq!(response.sink.ends, 1);
    assert_eq!(hooks.after.load(Ordering::SeqCst), 1);
    assert_eq!(backend.write_count(), 1);
    assert!(response.sink.cookie("RESIDENTSESSID").is_some());
}

#[tokio::test]
async fn it_should_send_the_replacement_response_of_an_early_exit() {
    let (worker, _) = worker();

    let response = testing::get(&worker, "/exit/replace").await;

    assert_eq!(response.status(), Some(202));
    assert_eq!(response.body(), "replaced");
    assert_eq!(response.served.exit_status, 0);
}

#[tokio::test]
async fn it_should_answer_a_panic_with_a_500_and_keep_serving() {
    let _guard = panic_lock();
    let (worker, _) = worker();
    let reserve = worker.faults().reserve_len();

    let response = testing::get(&worker, "/panic").await;
    let next = testing::get(&worker, "/").await;

    assert_eq!(response.status(), Some(500));
    assert_eq!(response.sink.ends, 1);
    assert_eq!(response.served.verdict, Verdict::Continue);
    assert!(!worker.is_terminated());
    assert_eq!(worker.faults().reserve_len(), reserve);
    assert_eq!(next.status(), Some(200));
    assert_eq!(next.body(), "index");
}

#[tokio::test]
async fn it_should_terminate_the_worker_after_a_fatal_fault() {
    let _guard = panic_lock();
    let (worker, _) = worker();

    let response = testing::get(&worker, "/fatal").await;

    assert_eq!(response.status(), Some(500));
    assert_eq!(response.sink.ends, 1);
    assert_eq!(response.served.verdict, Verdict::Terminate);
    assert!(worker.is_terminated());
    assert_eq!(worker.faults().reserve_len(), 0);
    assert_eq!(last_error::peek(), None);

    let refused = testing::get(&worker, "/").await;
    assert_eq!(refused.status(), Some(503));
    assert_eq!(refused.sink.ends, 1);
}

#[tokio::test]
async fn it_should_stream_a_byte_range_of_a_file() {
    let content: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&content).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let app = Application::new(WorkerConfig::default(), backend)
        .with_shared(Download(file.path().to_path_buf()))
        .with_access_writer(std::io::sink());
    let worker = Worker::new(app, Site);

    let response = testing::request(&worker, "GET", "/download", &[("Range", "bytes=100-199")], "").await;

    assert_eq!(response.status(), Some(206));
    assert_eq!(response.header("Content-Range"), Some("bytes 100-199/2000"));
    assert_eq!(response.header("Content-Length"), Some("100"));
    assert_eq!(response.sink.body(), content[100..200].to_vec());
    assert_eq!(response.sink.ends, 1);
}

#[tokio::test]
async fn it_should_refuse_an_unsatisfiable_file_range() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 300]).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let app = Application::new(WorkerConfig::default(), backend)
        .with_shared(Download(file.path().to_path_buf()))
        .with_access_writer(std::io::sink());
    let worker = Worker::new(app, Site);

    let response = testing::request(&worker, "GET", "/download", &[("Range", "bytes=900-")], "").await;

    assert_eq!(response.status(), Some(416));
    assert_eq!(response.sink.ends, 1);
}

#[tokio::test]
async fn it_should_write_an_access_line_in_debug_mode() {
    let out = SharedBuf::default();
    let config = WorkerConfig {
        debug: true,
        ..WorkerConfig::default()
    };
    let app = Application::new(config, Arc::new(MemoryBackend::new())).with_access_writer(out.clone());
    let worker = Worker::new(app, Site);

    testing::get(&worker, "/inspect?x=1").await;

    let written = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    assert_eq!(written.matches("\r\n").count(), 1);
    assert!(written.contains("/inspect?x=1"));
    assert!(written.contains("GET"));
}

#[test]
fn it_should_read_a_request_off_raw_bytes() {
    let request = testing::raw_request(
        "POST",
        "/form?a=1",
        &[("Content-Type", "application/x-www-form-urlencoded")],
        "name=jo",
    );

    assert_eq!(request.query_param("a"), Some("1"));
    assert_eq!(request.body_param("name"), Some("jo"));
    assert_eq!(request.header("host"), Some("localhost:8080"));
}

#[test]
fn it_should_serve_from_a_recording_sink_directly() {
    let _ = Runtime::new().unwrap().block_on(async {
        let (worker, _) = worker();
        let mut sink = RecordingSink::new();

        let served = worker.serve(&Request::new("GET", "/"), &mut sink).await;

        assert_eq!(served.status, 200);
        assert_eq!(sink.body_string(), "index");
        assert_eq!(worker.served(), 1);
    });
}

#[test]
fn it_should_record_panics_once_the_hook_is_installed() {
    let _guard = panic_lock();
    let config = WorkerConfig {
        record_panics: true,
        ..WorkerConfig::default()
    };
    let _worker = worker_with(config, Arc::new(MemoryBackend::new()));
    last_error::take();

    let result = std::panic::catch_unwind(|| panic!("stray panic"));

    assert!(result.is_err());
    let last = last_error::take().unwrap();
    assert_eq!(last.severity, Severity::Error);
    assert_eq!(last.message, "stray panic");
    assert!(last.location.unwrap().contains("integration_tests.rs"));
}
