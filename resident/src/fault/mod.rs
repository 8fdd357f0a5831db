pub mod access_log;
pub mod last_error;
pub mod renderer;

pub use self::renderer::{escape_html, FaultRenderer, HtmlFaultRenderer, RenderError, GENERIC_MESSAGE};

use bytes::Bytes;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::config::WorkerConfig;
use crate::context::RequestContext;
use crate::core::errors::{Fault, FaultKind};
use crate::core::response::ResponseSink;
use crate::lifecycle::{PostDispatch, Verdict};

///
/// The last resort of a request. Turns faults into error responses, falls
/// back to a fixed message written straight to the transport when that
/// fails, and handles panics that turn out to be fatal to the worker.
///
pub struct FaultHandler {
    renderer: Box<dyn FaultRenderer>,
    debug: bool,
    discard_existing_output: bool,
    reserve_size: usize,
    // Freed first on the fatal path to make room for reporting.
    reserve: Mutex<Option<Vec<u8>>>,
}

impl FaultHandler {
    pub fn new(config: &WorkerConfig) -> FaultHandler {
        let reserve = if config.memory_reserve_size > 0 {
            Some(vec![b'x'; config.memory_reserve_size])
        } else {
            None
        };

        FaultHandler {
            renderer: Box::new(HtmlFaultRenderer),
            debug: config.debug,
            discard_existing_output: config.discard_existing_output,
            reserve_size: config.memory_reserve_size,
            reserve: Mutex::new(reserve),
        }
    }

    pub fn with_renderer<R: FaultRenderer + 'static>(mut self, renderer: R) -> FaultHandler {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Bytes currently held in reserve.
    pub fn reserve_len(&self) -> usize {
        match self.reserve.lock() {
            Ok(reserve) => reserve.as_ref().map(Vec::len).unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().as_ref().map(Vec::len).unwrap_or(0),
        }
    }

    fn release_reserve(&self) -> usize {
        let released = match self.reserve.lock() {
            Ok(mut reserve) => reserve.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        released.map(|r| r.len()).unwrap_or(0)
    }

    fn rearm(&self) {
        if self.reserve_size == 0 {
            return;
        }

        let mut reserve = match self.reserve.lock() {
            Ok(reserve) => reserve,
            Err(poisoned) => poisoned.into_inner(),
        };
        if reserve.is_none() {
            *reserve = Some(vec![b'x'; self.reserve_size]);
        }
    }

    ///
    /// Answer the request with an error page for `fault`. Existing output is
    /// discarded, the status comes from the fault, and post-dispatch work
    /// still runs. Any failure on the way ends in `fallback`.
    ///
    pub async fn handle_exception(
        &self,
        fault: Fault,
        ctx: &mut RequestContext<'_>,
        sink: &mut dyn ResponseSink,
        post: &mut dyn PostDispatch,
    ) {
        if let Err(secondary) = self.report(&fault, ctx, sink, post).await {
            self.fallback(secondary, &fault, ctx, sink, post).await;
        }
    }

    async fn report(
        &self,
        fault: &Fault,
        ctx: &mut RequestContext<'_>,
        sink: &mut dyn ResponseSink,
        post: &mut dyn PostDispatch,
    ) -> Result<(), Fault> {
        log_fault(fault, ctx);

        if ctx.response.is_sent() {
            return post.after_request(ctx).await;
        }

        if self.discard_existing_output {
            ctx.response.clear_output();
            ctx.response.remove("Content-Length");
        }

        let renderer = &self.renderer;
        let debug = self.debug;
        let request = ctx.request;
        let response = &mut ctx.response;
        match panic::catch_unwind(AssertUnwindSafe(|| renderer.render(fault, request, debug, response))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Fault::application(format!("failed to render the error page: {}", e)).with_cause(e))
            }
            Err(payload) => return Err(Fault::from_panic(&*payload)),
        }

        ctx.response.status(fault.status_code());
        post.after_request(ctx).await?;
        ctx.response.send(sink).await?;

        Ok(())
    }

    async fn fallback(
        &self,
        secondary: Fault,
        original: &Fault,
        ctx: &mut RequestContext<'_>,
        sink: &mut dyn ResponseSink,
        post: &mut dyn PostDispatch,
    ) {
        let mut message = format!(
            "An error occurred while handling another error:\n{}\nPrevious error:\n{}",
            secondary, original
        );

        if !ctx.response.is_sent() {
            ctx.response.mark_sent();

            let body = if self.debug {
                format!("<pre>{}</pre>", escape_html(&message))
            } else {
                GENERIC_MESSAGE.to_owned()
            };
            if let Err(e) = write_minimal(sink, body).await {
                error!("failed to write the fallback response: {}", e);
            }
        }

        if !post.has_run() {
            if let Err(e) = post.after_request(ctx).await {
                error!("post-dispatch work failed on the fallback path: {}", e);
            }
        }

        message.push_str(&format!("\nserver = {:?}", ctx.request.server));
        error!("{}", message);

        ctx.log.flush();
        log::logger().flush();
    }

    ///
    /// Handle a panic caught at the controller boundary. The reserve is freed
    /// and the last recorded error decides: a fatal record is reported and
    /// terminates the worker, anything else is an ordinary 500.
    ///
    pub async fn handle_fatal(
        &self,
        payload: Box<dyn Any + Send>,
        ctx: &mut RequestContext<'_>,
        sink: &mut dyn ResponseSink,
        post: &mut dyn PostDispatch,
    ) -> Verdict {
        let released = self.release_reserve();

        match last_error::take() {
            Some(last) if last.severity.is_fatal() => {
                debug!("released {} reserved bytes for fault handling", released);

                let mut fault = Fault::new(
                    FaultKind::Panic,
                    format!("{:?}: {}", last.severity, last.message),
                )
                .with_status(500);
                if let Some(location) = last.location {
                    fault.message.push_str(&format!(" at {}", location));
                }

                self.handle_exception(fault, ctx, sink, post).await;

                ctx.log.flush();
                log::logger().flush();

                Verdict::Terminate
            }
            _ => {
                self.rearm();
                self.handle_exception(Fault::from_panic(&*payload), ctx, sink, post)
                    .await;

                Verdict::Continue
            }
        }
    }
}

fn log_fault(fault: &Fault, ctx: &mut RequestContext<'_>) {
    let category = match fault.kind {
        FaultKind::Http => format!("http {}", fault.status_code()),
        FaultKind::Panic => "panic".to_owned(),
        FaultKind::Application => "application".to_owned(),
    };
    let detail = format!("{} on {} {}", fault.chain().join(": "), ctx.request.method(), ctx.request.url());

    if fault.status_code() < 500 {
        ctx.log.warning(&category, &detail);
    } else {
        ctx.log.error(&category, &detail);
    }
}

async fn write_minimal(sink: &mut dyn ResponseSink, body: String) -> io::Result<()> {
    sink.status(500).await?;
    sink.header("Content-Type", "text/html; charset=UTF-8").await?;
    sink.end(Some(Bytes::from(body))).await
}
