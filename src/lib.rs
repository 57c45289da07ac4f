#![forbid(unsafe_code)]
//! Lazy, batched and memoized resolution of derived attributes on
//! version-control and code-review objects.
//!
//! Objects such as commit symbols, revisions or buildables are stored as
//! refs in an [`Engine`]. Each ref type declares named *hardpoints*, slots
//! for derived values like "the commit this symbol names" or "the parents of
//! this revision". Filling a hardpoint is the job of a [`Producer`]; the
//! engine picks the producers, groups refs so each producer sees one batch
//! per hardpoint, and runs their external operations concurrently.
//!
//! ```rust,no_run
//! use hardpoint::refs::{CommitRef, CommitSymbolRef};
//! use hardpoint::{Config, Engine, Environment};
//!
//! # fn run() -> anyhow::Result<()> {
//! let Some(repository) = hardpoint::repository::discover(".") else {
//!     return Ok(());
//! };
//! let env = Environment::new(Config::default()).with_repository(repository);
//! let mut engine = Engine::builder(env)
//!     .producers(hardpoint::query::producers())
//!     .build()?;
//!
//! let head = engine.insert(CommitSymbolRef::new("HEAD")?);
//! engine.resolve(&[head], &[CommitSymbolRef::OBJECT])?;
//!
//! let object = engine.hardpoint(head, CommitSymbolRef::OBJECT)?;
//! if let Some(commit) = object.as_ref_id().and_then(|id| engine.get::<CommitRef>(id)) {
//!     println!("{}", commit.hash());
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod channel;
mod core;
pub mod engine;
mod error;
pub mod future;
pub mod producer;
pub mod query;
pub mod refs;
pub mod repository;
pub mod symbols;
#[cfg(test)]
mod testing;

pub use crate::core::{Cardinality, Config, Environment, Hardpoint, RefId, Value};
pub use crate::engine::{Diagnostics, Engine, EngineBuilder, QueryContext};
pub use crate::error::*;
pub use crate::producer::{Applicability, Loader, Producer, Query, ResultMap};
pub use crate::symbols::{SymbolEngine, SymbolMap};
