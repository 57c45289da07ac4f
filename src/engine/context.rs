use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;

use crate::core::{Environment, RefId, Value};
use crate::engine::pool::OpId;
use crate::engine::{RequestId, Shared};
use crate::error::{EngineError, FutureError, SharedError};
use crate::future::Conduit;
use crate::producer::ResultMap;
use crate::refs::{Ref, RepositoryRef};
use crate::repository::RepositoryApi;

/// What a producer body sees of the engine.
///
/// Awaiting a [`FutureHandle`] or a [`RequestHandle`] is how a producer
/// suspends. Nothing else returns control to the scheduler.
#[derive(Clone)]
pub struct QueryContext {
    shared: Rc<Shared>,
}

impl QueryContext {
    pub(crate) fn new(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    pub fn env(&self) -> &Environment {
        &self.shared.env
    }

    pub fn repository(&self) -> Result<Arc<dyn RepositoryApi>, EngineError> {
        self.shared.env.repository.clone().ok_or(EngineError::NoRepository)
    }

    pub fn conduit(&self) -> Result<Arc<dyn Conduit>, EngineError> {
        self.shared.env.conduit.clone().ok_or(EngineError::NoConduit)
    }

    /// The remote repository the working copy belongs to, if known.
    pub fn remote(&self) -> Option<&RepositoryRef> {
        self.shared.env.remote.as_ref()
    }

    /// Stores a new ref. Symbol-like refs are deduplicated by identity.
    pub fn insert<R: Ref>(&self, object: R) -> RefId {
        self.shared.state.borrow_mut().refs.insert(object)
    }

    /// A copy of a stored ref, if it has type `R`.
    pub fn read<R: Ref + Clone>(&self, id: RefId) -> Option<R> {
        self.shared.state.borrow().refs.downcast::<R>(id).cloned()
    }

    /// Runs `f` on a stored ref, if it has type `R`.
    pub fn with_ref<R: Ref, T>(&self, id: RefId, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.shared.state.borrow().refs.downcast::<R>(id).map(f)
    }

    /// Value of a hardpoint that has already been resolved.
    pub fn value(&self, id: RefId, key: &str) -> Result<Value, EngineError> {
        self.shared.state.borrow().refs.hardpoint(id, key).cloned()
    }

    /// Hands an operation to the pool. It starts as soon as the scheduler gets
    /// control back, so several operations submitted before the first
    /// `.await` run concurrently.
    pub fn future<F, T>(&self, op: F) -> FutureHandle<T>
    where
        F: Future<Output = Result<T, FutureError>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.shared.state.borrow_mut().pool.submit(op);
        FutureHandle {
            shared: self.shared.clone(),
            id,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Submits every operation, then waits for all of them. Results come back
    /// in submission order.
    pub async fn futures<F, T>(&self, ops: impl IntoIterator<Item = F>) -> Vec<Result<T, FutureError>>
    where
        F: Future<Output = Result<T, FutureError>> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<FutureHandle<T>> = ops.into_iter().map(|op| self.future(op)).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await);
        }
        results
    }

    /// Asks for hardpoint `key` on `refs`. The handle completes once the
    /// hardpoint is resolved on every one of them.
    pub fn request(&self, refs: &[RefId], key: &str) -> RequestHandle {
        let mut state = self.shared.state.borrow_mut();
        let task = state.current;
        let id = state.add_request(refs.to_vec(), key, task);
        state.deferred.push(id);
        RequestHandle {
            shared: self.shared.clone(),
            id,
            done: false,
        }
    }

    /// Requests `key` on `refs` and returns the resolved values in the same
    /// order.
    pub async fn hardpoints(&self, refs: &[RefId], key: &str) -> anyhow::Result<Vec<Value>> {
        self.request(refs, key).await?;
        refs.iter()
            .map(|&id| self.value(id, key).map_err(Into::into))
            .collect()
    }

    /// Result map giving every ref the same value.
    pub fn value_map(refs: &[RefId], value: Value) -> ResultMap {
        refs.iter().map(|&id| (id, value.clone())).collect()
    }
}

/// A pending operation submitted through [`QueryContext::future`].
#[must_use = "operations are only useful when awaited"]
pub struct FutureHandle<T> {
    shared: Rc<Shared>,
    id: OpId,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Future for FutureHandle<T> {
    type Output = Result<T, FutureError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = {
            let mut state = self.shared.state.borrow_mut();
            match state.pool.take_result(self.id) {
                Some(result) => result,
                None => {
                    state.pool.set_waiter(self.id, cx.waker());
                    return Poll::Pending;
                }
            }
        };

        self.done = true;
        Poll::Ready(result.and_then(|value| {
            value
                .downcast::<T>()
                .map(|value| *value)
                .map_err(|_| FutureError::Type)
        }))
    }
}

impl<T> Drop for FutureHandle<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.shared.state.try_borrow_mut() {
            state.pool.forget(self.id);
        }
    }
}

/// A pending nested hardpoint request, see [`QueryContext::request`].
#[must_use = "requests are only useful when awaited"]
pub struct RequestHandle {
    shared: Rc<Shared>,
    id: RequestId,
    done: bool,
}

impl Future for RequestHandle {
    type Output = Result<(), SharedError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = {
            let mut state = self.shared.state.borrow_mut();
            let Some(request) = state.requests.get_mut(&self.id) else {
                return Poll::Ready(Err(SharedError::new(anyhow!(
                    "Hardpoint request vanished before it completed"
                ))));
            };
            match request.outcome.clone() {
                Some(outcome) => {
                    state.requests.remove(&self.id);
                    outcome
                }
                None => {
                    request.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        };

        self.done = true;
        Poll::Ready(outcome)
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.shared.state.try_borrow_mut() {
            state.requests.remove(&self.id);
        }
    }
}
