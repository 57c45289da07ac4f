//! Handles to external asynchronous operations.
//!
//! An operation is any `Send` future resolving to `Result<T, FutureError>`.
//! Producers hand operations to the engine, which runs them in its pool; the
//! two kinds this crate ships are subprocesses ([`ExecFuture`]) and conduit
//! calls ([`Conduit`], [`ConduitSearch`]).

mod conduit;
mod exec;

use std::future::Future;
use std::pin::Pin;

pub use conduit::{Conduit, ConduitSearch};
pub(crate) use conduit::{next_cursor, with_cursor};
pub use exec::{ExecFuture, ExecOutput, RunningExec};

use crate::error::FutureError;

/// A boxed operation that can be moved into the engine's pool.
pub type OpFuture<T> = Pin<Box<dyn Future<Output = Result<T, FutureError>> + Send + 'static>>;
