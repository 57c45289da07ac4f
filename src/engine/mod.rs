//! The hardpoint resolution engine.
//!
//! [`Engine::resolve`] takes a set of refs and hardpoint keys and drives every
//! producer needed to fill them. Producer bodies are `async` blocks polled on
//! this thread only; they suspend on operations (handed to a bounded pool on a
//! current-thread tokio runtime) or on nested hardpoint requests, which are
//! batched by key at the end of each polling round.

mod context;
mod diagnostics;
mod pool;
mod state;
#[cfg(test)]
mod tests;
mod waker;

use std::cell::{self, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use anyhow::anyhow;
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

pub use crate::engine::context::{FutureHandle, QueryContext, RequestHandle};
pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};

use crate::core::{Environment, RefId, Value};
use crate::engine::pool::{AnyResult, OpId, describe_panic};
use crate::engine::state::{NewTask, State};
use crate::engine::waker::ReadyQueue;
use crate::error::EngineError;
use crate::producer::Producer;
use crate::refs::{Ref, RefStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RequestId(pub(crate) u64);

/// Engine state reachable from producer bodies.
pub(crate) struct Shared {
    pub(crate) state: RefCell<State>,
    pub(crate) producers: Vec<Producer>,
    pub(crate) env: Environment,
    pub(crate) ready: Arc<ReadyQueue>,
}

pub struct EngineBuilder {
    env: Environment,
    producers: Vec<Producer>,
}

impl EngineBuilder {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            producers: Vec::new(),
        }
    }

    pub fn producer(mut self, producer: Producer) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn producers(mut self, producers: impl IntoIterator<Item = Producer>) -> Self {
        self.producers.extend(producers);
        self
    }

    /// Builds the engine. Producers that do not apply to the environment are
    /// dropped here, registration order is kept for the rest.
    pub fn build(self) -> Result<Engine, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let env = self.env;
        let producers: Vec<Producer> = self
            .producers
            .into_iter()
            .filter(|producer| {
                let keep = producer.can_apply_env(&env);
                if !keep {
                    tracing::debug!(producer = producer.name(), "producer does not apply here");
                }
                keep
            })
            .collect();

        tracing::debug!(producers = producers.len(), "engine ready");

        let ready = Arc::new(ReadyQueue::default());
        let state = State::new(env.config.future_limit, Arc::clone(&ready));

        Ok(Engine {
            shared: Rc::new(Shared {
                state: RefCell::new(state),
                producers,
                env,
                ready,
            }),
            runtime,
        })
    }
}

/// Owns the ref arena, the producer registry and the runtime that drives
/// operations.
pub struct Engine {
    shared: Rc<Shared>,
    runtime: Runtime,
}

impl Engine {
    pub fn builder(env: Environment) -> EngineBuilder {
        EngineBuilder::new(env)
    }

    pub fn environment(&self) -> &Environment {
        &self.shared.env
    }

    pub fn producers(&self) -> &[Producer] {
        &self.shared.producers
    }

    /// Stores a ref. Symbol-like refs are deduplicated by identity, so the same
    /// symbol inserted twice gives the same handle.
    pub fn insert<R: Ref>(&self, object: R) -> RefId {
        self.shared.state.borrow_mut().refs.insert(object)
    }

    pub fn get<R: Ref + Clone>(&self, id: RefId) -> Option<R> {
        self.shared.state.borrow().refs.downcast::<R>(id).cloned()
    }

    /// Read access to the arena, for [`RefStore::state`] and friends.
    pub fn refs(&self) -> cell::Ref<'_, RefStore> {
        cell::Ref::map(self.shared.state.borrow(), |state| &state.refs)
    }

    /// The resolved value of a hardpoint. Fails unless the hardpoint was
    /// resolved earlier.
    pub fn hardpoint(&self, id: RefId, key: &str) -> Result<Value, EngineError> {
        self.shared.state.borrow().refs.hardpoint(id, key).cloned()
    }

    /// Supplies a hardpoint value up front, so no producer runs for it.
    /// Fails if the hardpoint already has a value.
    pub fn attach(&self, id: RefId, key: &str, value: Value) -> Result<(), EngineError> {
        self.shared.state.borrow_mut().refs.attach(id, key, value)
    }

    /// Execution records of every task run so far.
    pub fn diagnostics(&self) -> Diagnostics {
        let state = self.shared.state.borrow();
        let mut diagnostics = state.diagnostics.clone();
        diagnostics.operations = state.pool.submitted();
        diagnostics
    }

    /// Resolves every hardpoint in `keys` on every ref in `refs`.
    ///
    /// Values are read afterwards with [`Engine::hardpoint`]. Hardpoints that
    /// are already resolved cost nothing. If a producer fails, the first error
    /// (in `keys` order) is returned; values resolved by other tasks stay.
    pub fn resolve(&mut self, refs: &[RefId], keys: &[&str]) -> Result<(), EngineError> {
        let s = Instant::now();
        let shared = Rc::clone(&self.shared);

        {
            let state = shared.state.borrow();
            for key in keys {
                state.validate(&shared.producers, refs, key)?;
            }
        }

        let roots: Vec<RequestId> = {
            let mut state = shared.state.borrow_mut();
            keys.iter()
                .map(|key| state.add_request(refs.to_vec(), key, None))
                .collect()
        };

        let created = shared.state.borrow_mut().open(&shared.producers, &roots);
        spawn_tasks(&shared, created);

        let driven = self.runtime.block_on(drive(&shared));

        let mut failure = None;
        {
            let mut state = shared.state.borrow_mut();
            for id in &roots {
                if let Some(request) = state.requests.remove(id)
                    && let Some(Err(err)) = request.outcome
                    && failure.is_none()
                {
                    failure = Some(err);
                }
            }
        }

        driven?;

        tracing::info!(
            refs = refs.len(),
            keys = ?keys,
            failed = failure.is_some(),
            "resolved hardpoints {}",
            as_overhead(s)
        );

        match failure {
            Some(err) => Err(EngineError::Failed(err)),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Task bodies hold the shared state, break the cycle.
        let tasks = std::mem::take(&mut self.shared.state.borrow_mut().tasks);
        drop(tasks);
    }
}

fn as_overhead(s: Instant) -> String {
    let elapsed = s.elapsed();
    format!("in {:.2?}", elapsed)
}

/// Runs until every task finished, or until nothing moved for
/// `stall_rounds` rounds in a row.
async fn drive(shared: &Rc<Shared>) -> Result<(), EngineError> {
    let interval = shared.env.config.poll_interval();
    let stall_rounds = shared.env.config.stall_rounds.max(1);
    let mut idle = 0;

    loop {
        let mut progress = open_deferred(shared);
        progress |= poll_ready(shared);

        {
            let state = shared.state.borrow();
            if state.tasks.is_empty() && state.deferred.is_empty() {
                return Ok(());
            }
        }

        let next = {
            let mut state = shared.state.borrow_mut();
            state.pool.fill();
            if progress || !shared.ready.is_empty() || !state.deferred.is_empty() {
                Next::Again
            } else if state.pool.is_idle() {
                Next::Idle
            } else {
                Next::Wait(state.pool.take_running())
            }
        };

        match next {
            Next::Again => {
                idle = 0;
                tokio::task::yield_now().await;
            }
            Next::Idle => {
                idle += 1;
                tracing::debug!(round = idle, "no progress");
                if idle >= stall_rounds {
                    let (blocked, cycle) = shared.state.borrow().blocked_report();
                    abandon(shared);
                    return Err(EngineError::Stalled {
                        rounds: idle,
                        blocked,
                        cycle,
                    });
                }
                tokio::time::sleep(interval).await;
            }
            Next::Wait(mut running) => {
                idle = 0;
                let joined = tokio::time::timeout(interval, running.join_next_with_id()).await;

                let mut state = shared.state.borrow_mut();
                state.pool.restore_running(running);
                if let Ok(Some(joined)) = joined {
                    state.pool.complete(joined);
                }
                let drained = state.pool.drain_finished();
                tracing::trace!(in_flight = state.pool.in_flight(), drained, "pool");
            }
        }
    }
}

enum Next {
    /// Something moved, go again.
    Again,
    /// Nothing to poll and nothing in flight.
    Idle,
    Wait(JoinSet<(OpId, AnyResult)>),
}

/// Opens nested requests made during the last round, all at once.
fn open_deferred(shared: &Rc<Shared>) -> bool {
    let created = {
        let mut state = shared.state.borrow_mut();
        if state.deferred.is_empty() {
            return false;
        }
        let deferred = std::mem::take(&mut state.deferred);
        state.open(&shared.producers, &deferred)
    };
    spawn_tasks(shared, created);
    true
}

fn spawn_tasks(shared: &Rc<Shared>, created: Vec<NewTask>) {
    for task in created {
        let cx = QueryContext::new(Rc::clone(shared));
        let future = shared.producers[task.producer].start(cx, task.refs, task.key);

        let mut state = shared.state.borrow_mut();
        if let Some(entry) = state.tasks.get_mut(&task.id) {
            entry.future = Some(future);
        }
        drop(state);
        shared.ready.push(task.id);
    }
}

/// Polls every woken task once.
fn poll_ready(shared: &Rc<Shared>) -> bool {
    let mut progress = false;

    for id in shared.ready.drain() {
        let taken = {
            let mut state = shared.state.borrow_mut();
            state.tasks.get_mut(&id).and_then(|task| {
                let future = task.future.take()?;
                Some((future, task.waker.clone(), task.producer, task.key, task.refs.len()))
            })
        };
        let Some((mut future, waker, producer, key, refs)) = taken else {
            continue;
        };
        progress = true;

        let span = tracing::debug_span!("task", producer, hardpoint = key, refs);
        let _enter = span.enter();

        shared.state.borrow_mut().current = Some(id);
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        shared.state.borrow_mut().current = None;

        match polled {
            Ok(Poll::Pending) => {
                let mut state = shared.state.borrow_mut();
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.future = Some(future);
                }
            }
            Ok(Poll::Ready(result)) => {
                drop(future);
                shared.state.borrow_mut().complete(id, result);
            }
            Err(payload) => {
                drop(future);
                let message = describe_panic(payload.as_ref());
                shared
                    .state
                    .borrow_mut()
                    .complete(id, Err(anyhow!("Producer panicked: {message}")));
            }
        }
    }

    progress
}

/// Fails every remaining task after a stall.
fn abandon(shared: &Rc<Shared>) {
    let futures: Vec<_> = {
        let mut state = shared.state.borrow_mut();
        state.deferred.clear();
        state
            .tasks
            .values_mut()
            .filter_map(|task| task.future.take())
            .collect()
    };
    // Dropping task bodies releases their handles, which need the state.
    drop(futures);

    let mut state = shared.state.borrow_mut();
    let mut ids: Vec<TaskId> = state.tasks.keys().copied().collect();
    ids.sort();
    for id in ids {
        state.complete(
            id,
            Err(anyhow!("Task abandoned because hardpoint resolution stalled")),
        );
    }
    drop(state);
    shared.ready.drain();
}
