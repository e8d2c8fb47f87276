#![forbid(unsafe_code)]

//! The OS debug-control resource behind an attach session.
//!
//! A backend owns exactly one debugger connection to at most one target.
//! Everything it does is asynchronous and may be abandoned at any await
//! point; implementations must tolerate a later call after a dropped one.

pub mod gdb;
pub mod mi;

pub use gdb::{GdbBackend, GdbFactory};

use crate::error::BackendError;
use async_trait::async_trait;

#[async_trait]
pub trait DebugBackend: Send {
    /// Take debug control of `pid`. Resolves once the target is stopped
    /// under our control.
    async fn attach(&mut self, pid: i32) -> Result<(), BackendError>;

    /// Evaluate `expression` inside the stopped target and return the
    /// rendered value. Function calls in the expression run in the target.
    async fn evaluate(&mut self, expression: &str) -> Result<String, BackendError>;

    /// Let the stopped target run while staying attached.
    async fn resume(&mut self) -> Result<(), BackendError>;

    /// Stop a resumed target again. Resolves once it is stopped; a no-op
    /// when it already is.
    async fn pause(&mut self) -> Result<(), BackendError>;

    /// Ask an in-flight [`evaluate`](Self::evaluate) to give up. Best effort:
    /// the called code may not honour the request.
    async fn interrupt(&mut self) -> Result<(), BackendError>;

    /// Release the target and let it run freely again. Stops a resumed
    /// target first if the transport needs that.
    async fn detach(&mut self) -> Result<(), BackendError>;

    /// Tear the backend down without talking to the target. Must not fail
    /// and must be safe to call more than once.
    async fn shutdown(&mut self);
}

/// Creates one backend per attach session.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn DebugBackend>, BackendError>;
}
