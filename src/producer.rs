//! Producers fill hardpoints.
//!
//! A producer declares which hardpoints it can fill and on which refs. There
//! are two kinds: a [`Query`] is asynchronous and suspends on operations or
//! nested requests, a [`Loader`] is synchronous and derives its answer from
//! hardpoints it lists as [`Loader::requires`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::refs::Ref;

/// Values a producer computed for a batch, keyed by ref. A ref missing from
/// the map resolves to the empty value for the hardpoint's cardinality.
pub type ResultMap = BTreeMap<RefId, Value>;

pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

/// The body of one task.
pub type TaskFuture = LocalBoxFuture<anyhow::Result<ResultMap>>;

/// What every producer declares about itself.
pub trait Applicability {
    fn name(&self) -> &'static str;

    /// Hardpoint keys this producer can fill.
    fn hardpoints(&self) -> &'static [&'static str];

    /// Checked once, when the engine is built.
    fn can_apply_env(&self, _env: &Environment) -> bool {
        true
    }

    /// Whether this producer handles the given ref. Must not depend on any
    /// hardpoint of the ref.
    fn can_apply(&self, object: &dyn Ref) -> bool;
}

pub trait Query: Applicability {
    /// Computes `hardpoint` for a batch of refs. Every ref in `refs` is one the
    /// producer said it can apply to.
    fn load(self: Rc<Self>, cx: QueryContext, refs: Vec<RefId>, hardpoint: &'static str)
    -> TaskFuture;
}

pub trait Loader: Applicability {
    /// Hardpoints of the same refs that must be resolved before
    /// [`Loader::load`] runs.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    fn load(
        &self,
        cx: &QueryContext,
        refs: &[RefId],
        hardpoint: &'static str,
    ) -> anyhow::Result<ResultMap>;
}

/// A registered producer.
#[derive(Clone)]
pub enum Producer {
    Query(Rc<dyn Query>),
    Loader(Rc<dyn Loader>),
}

impl Producer {
    pub fn query(query: impl Query + 'static) -> Self {
        Producer::Query(Rc::new(query))
    }

    pub fn loader(loader: impl Loader + 'static) -> Self {
        Producer::Loader(Rc::new(loader))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Producer::Query(query) => query.name(),
            Producer::Loader(loader) => loader.name(),
        }
    }

    pub fn hardpoints(&self) -> &'static [&'static str] {
        match self {
            Producer::Query(query) => query.hardpoints(),
            Producer::Loader(loader) => loader.hardpoints(),
        }
    }

    pub fn fills(&self, key: &str) -> bool {
        self.hardpoints().contains(&key)
    }

    pub fn can_apply_env(&self, env: &Environment) -> bool {
        match self {
            Producer::Query(query) => query.can_apply_env(env),
            Producer::Loader(loader) => loader.can_apply_env(env),
        }
    }

    pub fn can_apply(&self, object: &dyn Ref) -> bool {
        match self {
            Producer::Query(query) => query.can_apply(object),
            Producer::Loader(loader) => loader.can_apply(object),
        }
    }

    /// Builds the future for one task.
    pub(crate) fn start(&self, cx: QueryContext, refs: Vec<RefId>, key: &'static str) -> TaskFuture {
        match self {
            Producer::Query(query) => Rc::clone(query).load(cx, refs, key),
            Producer::Loader(loader) => {
                let loader = Rc::clone(loader);
                Box::pin(async move {
                    for required in loader.requires() {
                        cx.request(&refs, required).await?;
                    }
                    loader.load(&cx, &refs, key)
                })
            }
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Producer::Query(query) => write!(f, "Query({})", query.name()),
            Producer::Loader(loader) => write!(f, "Loader({})", loader.name()),
        }
    }
}
