use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::context::RequestContext;
use crate::core::errors::Fault;
use crate::core::response::{Response, ResponseSink};
use crate::fault::FaultHandler;

///
/// The phases of a request, in the only order they may run.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    BeforeRequest,
    HandlingRequest,
    AfterRequest,
    SendingResponse,
    End,
}

///
/// A controlled stop. `response`, when given, replaces whatever the request
/// had built so far.
///
pub struct Exit {
    pub status: i32,
    pub response: Option<Response>,
}

///
/// What a hook or handler tells the lifecycle: carry on, stop early, or
/// fail with a fault that the fault handler turns into an error response.
///
pub enum Outcome {
    Continue,
    EarlyExit(Exit),
    Failure(Fault),
}

impl Outcome {
    pub fn exit(status: i32) -> Outcome {
        Outcome::EarlyExit(Exit {
            status,
            response: None,
        })
    }

    pub fn exit_with(status: i32, response: Response) -> Outcome {
        Outcome::EarlyExit(Exit {
            status,
            response: Some(response),
        })
    }

    pub fn fail(fault: impl Into<Fault>) -> Outcome {
        Outcome::Failure(fault.into())
    }
}

impl<E: Into<Fault>> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Outcome {
        match result {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}

///
/// The application: routing and everything behind it.
///
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext<'_>) -> Outcome;
}

///
/// Pre and post dispatch extension points. Session persistence and log
/// flushing run after `after_request` whether or not it is overridden.
///
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn before_request(&self, _ctx: &mut RequestContext<'_>) -> Outcome {
        Outcome::Continue
    }

    async fn after_request(&self, _ctx: &mut RequestContext<'_>) -> Result<(), Fault> {
        Ok(())
    }
}

pub struct NoHooks;

impl Hooks for NoHooks {}

///
/// Runs the post-dispatch work of a request. However often it is called,
/// the work runs at most once.
///
#[async_trait]
pub trait PostDispatch: Send {
    async fn after_request(&mut self, ctx: &mut RequestContext<'_>) -> Result<(), Fault>;
    fn has_run(&self) -> bool;
}

pub struct AfterRequest<'h> {
    hooks: &'h dyn Hooks,
    fired: bool,
}

impl<'h> AfterRequest<'h> {
    pub fn new(hooks: &'h dyn Hooks) -> AfterRequest<'h> {
        AfterRequest { hooks, fired: false }
    }
}

#[async_trait]
impl<'h> PostDispatch for AfterRequest<'h> {
    async fn after_request(&mut self, ctx: &mut RequestContext<'_>) -> Result<(), Fault> {
        if self.fired {
            return Ok(());
        }
        self.fired = true;

        let hooked = match AssertUnwindSafe(self.hooks.after_request(ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(Fault::from_panic(&*payload)),
        };
        let finished = ctx.finish_request().await;

        hooked.and(finished)
    }

    fn has_run(&self) -> bool {
        self.fired
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The worker can take the next request.
    Continue,
    /// A fatal fault was handled; the worker must stop.
    Terminate,
}

#[derive(Debug)]
pub struct Run {
    pub exit_status: i32,
    pub verdict: Verdict,
    /// Phases in the order they were entered.
    pub trace: Vec<State>,
}

enum Step {
    Done(Outcome),
    Panicked(Box<dyn Any + Send>),
}

///
/// Drives one request through `BeforeRequest`, `HandlingRequest`,
/// `AfterRequest`, `SendingResponse` and `End`. Whatever happens, the
/// response is sent once and the post-dispatch work runs once.
///
pub struct Lifecycle<'w> {
    handler: &'w dyn Handler,
    hooks: &'w dyn Hooks,
    faults: &'w FaultHandler,
    after: AfterRequest<'w>,
    state: State,
    trace: Vec<State>,
}

impl<'w> Lifecycle<'w> {
    pub fn new(handler: &'w dyn Handler, hooks: &'w dyn Hooks, faults: &'w FaultHandler) -> Lifecycle<'w> {
        Lifecycle {
            handler,
            hooks,
            faults,
            after: AfterRequest::new(hooks),
            state: State::BeforeRequest,
            trace: Vec::with_capacity(5),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn enter(&mut self, state: State) {
        self.state = state;
        self.trace.push(state);
    }

    pub async fn run(mut self, ctx: &mut RequestContext<'_>, sink: &mut dyn ResponseSink) -> Run {
        self.enter(State::BeforeRequest);
        let hooks = self.hooks;
        let step = match guard(hooks.before_request(ctx)).await {
            Step::Done(Outcome::Continue) => {
                self.enter(State::HandlingRequest);
                let handler = self.handler;
                guard(handler.handle(ctx)).await
            }
            other => other,
        };

        match step {
            Step::Done(Outcome::Continue) => self.complete(ctx, sink).await,
            Step::Done(Outcome::EarlyExit(exit)) => self.end(exit, ctx, sink).await,
            Step::Done(Outcome::Failure(fault)) => self.fail(fault, ctx, sink).await,
            Step::Panicked(payload) => self.fatal(payload, ctx, sink).await,
        }
    }

    async fn complete(mut self, ctx: &mut RequestContext<'_>, sink: &mut dyn ResponseSink) -> Run {
        self.enter(State::AfterRequest);
        if let Err(fault) = self.after.after_request(ctx).await {
            return self.fail(fault, ctx, sink).await;
        }

        self.enter(State::SendingResponse);
        if let Err(e) = ctx.response.send(sink).await {
            error!("failed to send the response for {}: {}", ctx.request.url(), e);
        }

        self.finish(ctx.exit_status, Verdict::Continue)
    }

    async fn end(mut self, exit: Exit, ctx: &mut RequestContext<'_>, sink: &mut dyn ResponseSink) -> Run {
        if let Some(mut response) = exit.response {
            if let Some(validator) = ctx.app.cookie_validator() {
                response.sign_cookies_with(validator.clone());
            }
            ctx.response = response;
        }
        ctx.exit_status = exit.status;

        if self.state < State::AfterRequest {
            self.enter(State::AfterRequest);
            if let Err(fault) = self.after.after_request(ctx).await {
                return self.fail(fault, ctx, sink).await;
            }
        }

        if self.state < State::SendingResponse {
            self.enter(State::SendingResponse);
            if let Err(e) = ctx.response.send(sink).await {
                error!("failed to send the response for {}: {}", ctx.request.url(), e);
            }
        }

        self.finish(exit.status, Verdict::Continue)
    }

    async fn fail(mut self, fault: Fault, ctx: &mut RequestContext<'_>, sink: &mut dyn ResponseSink) -> Run {
        self.enter_fault_path();
        let faults = self.faults;
        faults.handle_exception(fault, ctx, sink, &mut self.after).await;

        self.finish(1, Verdict::Continue)
    }

    async fn fatal(
        mut self,
        payload: Box<dyn Any + Send>,
        ctx: &mut RequestContext<'_>,
        sink: &mut dyn ResponseSink,
    ) -> Run {
        self.enter_fault_path();
        let faults = self.faults;
        let verdict = faults
            .handle_fatal(payload, ctx, sink, &mut self.after)
            .await;

        self.finish(1, verdict)
    }

    // The fault handler runs the remaining phases itself.
    fn enter_fault_path(&mut self) {
        if self.state < State::AfterRequest {
            self.enter(State::AfterRequest);
        }
        self.enter(State::SendingResponse);
    }

    fn finish(mut self, exit_status: i32, verdict: Verdict) -> Run {
        self.enter(State::End);

        Run {
            exit_status,
            verdict,
            trace: self.trace,
        }
    }
}

async fn guard<F>(future: F) -> Step
where
    F: std::future::Future<Output = Outcome>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => Step::Done(outcome),
        Err(payload) => Step::Panicked(payload),
    }
}
