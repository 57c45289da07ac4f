use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Wake, Waker};

use crate::engine::TaskId;

/// Tasks that were woken and should be polled in the next round.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue(Mutex<VecDeque<TaskId>>);

impl ReadyQueue {
    pub(crate) fn push(&self, id: TaskId) {
        let mut queue = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    /// Takes every queued task, in wake order.
    pub(crate) fn drain(&self) -> Vec<TaskId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Waking a task puts it back on the ready queue.
pub(crate) struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl TaskWaker {
    pub(crate) fn waker(id: TaskId, ready: &Arc<ReadyQueue>) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            ready: Arc::clone(ready),
        }))
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}
