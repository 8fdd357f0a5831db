#[macro_use]
extern crate log;

#[macro_use]
mod core;

pub mod app;
pub mod config;
pub mod context;
pub mod db;
pub mod fault;
pub mod isolation;
pub mod lifecycle;
pub mod middleware;
pub mod server;
pub mod session;
pub mod worker;

pub use crate::core::errors;
pub use crate::core::errors::{Fault, FaultKind, FaultSet};
pub use crate::core::request::{decode, Headers, ParamValue, Request, RequestSource, Upload, UploadedFile};
pub use crate::core::response::{Body, FileOptions, Response, ResponseSink};

pub use app::testing;
pub use config::WorkerConfig;
pub use context::{Context, RequestContext};
pub use fault::FaultHandler;
pub use lifecycle::{Handler, Hooks, Lifecycle, Outcome, State, Verdict};
pub use server::{ResidentServer, Server};
pub use session::{MemoryBackend, Session, SessionBackend, SessionStore};
pub use worker::{Application, Served, Worker};

#[cfg(feature = "hyper_server")]
pub use server::hyper_server;
