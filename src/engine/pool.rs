use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::Waker;

use tokio::task::{JoinError, JoinSet};

use crate::error::FutureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OpId(u64);

pub(crate) type AnyResult = Result<Box<dyn Any + Send>, FutureError>;
type BoxedOp = Pin<Box<dyn Future<Output = AnyResult> + Send>>;
pub(crate) type Joined = Result<(tokio::task::Id, (OpId, AnyResult)), JoinError>;

/// Operations requested by tasks. At most `limit` of them run at once on the
/// runtime, the rest wait in submission order.
pub(crate) struct OperationPool {
    limit: usize,
    next: u64,
    queued: VecDeque<(OpId, BoxedOp)>,
    running: JoinSet<(OpId, AnyResult)>,
    running_ids: HashMap<tokio::task::Id, OpId>,
    results: HashMap<OpId, AnyResult>,
    waiters: HashMap<OpId, Waker>,
    /// Operations whose handle was dropped; their results are discarded.
    forgotten: HashSet<OpId>,
    submitted: usize,
}

impl OperationPool {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            next: 0,
            queued: VecDeque::new(),
            running: JoinSet::new(),
            running_ids: HashMap::new(),
            results: HashMap::new(),
            waiters: HashMap::new(),
            forgotten: HashSet::new(),
            submitted: 0,
        }
    }

    pub(crate) fn submit<F, T>(&mut self, op: F) -> OpId
    where
        F: Future<Output = Result<T, FutureError>> + Send + 'static,
        T: Send + 'static,
    {
        let id = OpId(self.next);
        self.next += 1;
        self.submitted += 1;

        let op: BoxedOp = Box::pin(async move {
            op.await
                .map(|value| Box::new(value) as Box<dyn Any + Send>)
        });
        self.queued.push_back((id, op));
        id
    }

    /// Total number of operations ever submitted.
    pub(crate) fn submitted(&self) -> usize {
        self.submitted
    }

    /// Starts queued operations up to the limit. Must run inside the runtime.
    pub(crate) fn fill(&mut self) {
        while self.running.len() < self.limit {
            let Some((id, op)) = self.queued.pop_front() else {
                break;
            };
            let handle = self.running.spawn(async move { (id, op.await) });
            self.running_ids.insert(handle.id(), id);
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.queued.len() + self.running.len()
    }

    /// Moves the running set out so it can be awaited without holding a
    /// borrow of the engine state.
    pub(crate) fn take_running(&mut self) -> JoinSet<(OpId, AnyResult)> {
        std::mem::take(&mut self.running)
    }

    pub(crate) fn restore_running(&mut self, running: JoinSet<(OpId, AnyResult)>) {
        self.running = running;
    }

    /// Stores the result of a finished operation and wakes its waiter.
    pub(crate) fn complete(&mut self, joined: Joined) {
        let (id, result) = match joined {
            Ok((task, (id, result))) => {
                self.running_ids.remove(&task);
                (id, result)
            }
            Err(err) => {
                let Some(id) = self.running_ids.remove(&err.id()) else {
                    return;
                };
                (id, Err(FutureError::Panicked(panic_message(err))))
            }
        };

        if self.forgotten.remove(&id) {
            return;
        }

        self.results.insert(id, result);
        if let Some(waker) = self.waiters.remove(&id) {
            waker.wake();
        }
    }

    /// Collects operations that already finished, without waiting.
    pub(crate) fn drain_finished(&mut self) -> usize {
        let mut count = 0;
        while let Some(joined) = self.running.try_join_next_with_id() {
            self.complete(joined);
            count += 1;
        }
        count
    }

    pub(crate) fn take_result(&mut self, id: OpId) -> Option<AnyResult> {
        self.results.remove(&id)
    }

    pub(crate) fn set_waiter(&mut self, id: OpId, waker: &Waker) {
        match self.waiters.get_mut(&id) {
            Some(existing) if existing.will_wake(waker) => {}
            _ => {
                self.waiters.insert(id, waker.clone());
            }
        }
    }

    /// Drops interest in an operation. Queued operations never start, running
    /// ones finish but their result is thrown away.
    pub(crate) fn forget(&mut self, id: OpId) {
        self.waiters.remove(&id);
        if self.results.remove(&id).is_some() {
            return;
        }

        let queued = self.queued.len();
        self.queued.retain(|(other, _)| *other != id);
        if self.queued.len() == queued && self.running_ids.values().any(|other| *other == id) {
            self.forgotten.insert(id);
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "operation was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => describe_panic(payload.as_ref()),
        Err(_) => "unknown failure".to_string(),
    }
}

/// Best effort text of a panic payload.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
