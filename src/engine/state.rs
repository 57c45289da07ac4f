use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

use anyhow::anyhow;

use crate::core::{Cardinality, RefId, Value};
use crate::engine::diagnostics::{Diagnostics, TaskExecution};
use crate::engine::pool::OperationPool;
use crate::engine::waker::{ReadyQueue, TaskWaker};
use crate::engine::{RequestId, TaskId};
use crate::error::{EngineError, SharedError};
use crate::producer::{Producer, ResultMap, TaskFuture};
use crate::refs::{Pending, RefStore, Slot};

/// One producer working on one batch of refs for one hardpoint.
pub(crate) struct Task {
    pub(crate) producer: &'static str,
    pub(crate) key: &'static str,
    pub(crate) refs: Vec<RefId>,
    /// Taken out while the task is being polled.
    pub(crate) future: Option<TaskFuture>,
    pub(crate) waker: Waker,
    /// Requests waiting for this task to finish.
    pub(crate) dependents: Vec<RequestId>,
    pub(crate) started: Instant,
}

impl Task {
    pub(crate) fn label(&self) -> String {
        format!(
            "'{}' loading \"{}\" for {} ref(s)",
            self.producer,
            self.key,
            self.refs.len()
        )
    }
}

/// A request for one hardpoint on a set of refs.
pub(crate) struct Request {
    pub(crate) key: String,
    pub(crate) refs: Vec<RefId>,
    /// Tasks that have to finish before the request is complete.
    pub(crate) awaiting: BTreeSet<TaskId>,
    pub(crate) outcome: Option<Result<(), SharedError>>,
    pub(crate) waker: Option<Waker>,
    /// The task that made the request, `None` for requests made by callers
    /// of the engine.
    pub(crate) task: Option<TaskId>,
}

/// A task created by [`State::open`] that still needs its future.
pub(crate) struct NewTask {
    pub(crate) id: TaskId,
    pub(crate) producer: usize,
    pub(crate) refs: Vec<RefId>,
    pub(crate) key: &'static str,
}

pub(crate) struct State {
    pub(crate) refs: RefStore,
    pub(crate) tasks: HashMap<TaskId, Task>,
    pub(crate) requests: HashMap<RequestId, Request>,
    /// Nested requests made during the current round, opened together at the
    /// end of it.
    pub(crate) deferred: Vec<RequestId>,
    pub(crate) pool: OperationPool,
    /// Task being polled right now.
    pub(crate) current: Option<TaskId>,
    pub(crate) diagnostics: Diagnostics,
    ready: Arc<ReadyQueue>,
    epoch: Instant,
    next_task: u64,
    next_request: u64,
}

impl State {
    pub(crate) fn new(future_limit: usize, ready: Arc<ReadyQueue>) -> Self {
        Self {
            refs: RefStore::new(),
            tasks: HashMap::new(),
            requests: HashMap::new(),
            deferred: Vec::new(),
            pool: OperationPool::new(future_limit),
            current: None,
            diagnostics: Diagnostics::default(),
            ready,
            epoch: Instant::now(),
            next_task: 0,
            next_request: 0,
        }
    }

    pub(crate) fn add_request(
        &mut self,
        refs: Vec<RefId>,
        key: &str,
        task: Option<TaskId>,
    ) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;

        let mut seen = HashSet::new();
        let refs = refs.into_iter().filter(|id| seen.insert(*id)).collect();

        self.requests.insert(
            id,
            Request {
                key: key.to_string(),
                refs,
                awaiting: BTreeSet::new(),
                outcome: None,
                waker: None,
                task,
            },
        );
        id
    }

    /// Checks that every ref declares `key` and that a producer exists for
    /// every ref on which the hardpoint still has to be computed.
    pub(crate) fn validate(
        &self,
        producers: &[Producer],
        refs: &[RefId],
        key: &str,
    ) -> Result<(), EngineError> {
        for &id in refs {
            let hardpoint = self.refs.definition(id, key)?;
            if self.refs.slot(id, hardpoint.key).is_some() {
                continue;
            }
            let object = self.refs.get(id)?;
            if !producers
                .iter()
                .any(|producer| producer.fills(hardpoint.key) && producer.can_apply(object))
            {
                return Err(EngineError::NoProducer {
                    id,
                    ref_type: object.ref_type(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Starts work for a set of requests. Requests for the same hardpoint are
    /// batched together: every ref still unrequested across all of them is
    /// grouped by producer, one task per group. Refs already pending join the
    /// task in flight.
    pub(crate) fn open(&mut self, producers: &[Producer], ids: &[RequestId]) -> Vec<NewTask> {
        let mut by_key: BTreeMap<String, Vec<RequestId>> = BTreeMap::new();

        for &rid in ids {
            let Some(request) = self.requests.get(&rid) else {
                // Dropped before it was opened.
                continue;
            };
            match self.validate(producers, &request.refs, &request.key) {
                Ok(()) => by_key.entry(request.key.clone()).or_default().push(rid),
                Err(err) => self.settle(rid, Err(SharedError::new(err))),
            }
        }

        let mut created = Vec::new();

        for (key, rids) in by_key {
            let mut seen = HashSet::new();
            let fresh: Vec<RefId> = rids
                .iter()
                .filter_map(|rid| self.requests.get(rid))
                .flat_map(|request| request.refs.iter().copied())
                .filter(|&id| self.refs.slot(id, &key).is_none())
                .filter(|id| seen.insert(*id))
                .collect();

            let mut groups: BTreeMap<usize, Vec<RefId>> = BTreeMap::new();
            for &id in &fresh {
                for index in self.applicable(producers, id, &key) {
                    groups.entry(index).or_default().push(id);
                }
            }

            if !fresh.is_empty() {
                tracing::debug!(
                    key = %key,
                    refs = fresh.len(),
                    tasks = groups.len(),
                    requests = rids.len(),
                    "opening batch"
                );
            }

            for (index, batch) in groups {
                created.push(self.create_task(&producers[index], index, batch, &key));
            }

            for rid in rids {
                self.subscribe(rid, &key);
            }
        }

        created
    }

    fn applicable(&self, producers: &[Producer], id: RefId, key: &str) -> Vec<usize> {
        let (Ok(object), Ok(hardpoint)) = (self.refs.get(id), self.refs.definition(id, key)) else {
            return Vec::new();
        };

        let matching = producers
            .iter()
            .enumerate()
            .filter(|(_, producer)| producer.fills(hardpoint.key) && producer.can_apply(object))
            .map(|(index, _)| index);

        match hardpoint.cardinality {
            Cardinality::List => matching.collect(),
            Cardinality::Single | Cardinality::Map => matching.take(1).collect(),
        }
    }

    fn create_task(
        &mut self,
        producer: &Producer,
        index: usize,
        refs: Vec<RefId>,
        key: &str,
    ) -> NewTask {
        let id = TaskId(self.next_task);
        self.next_task += 1;

        let mut static_key: &'static str = "";
        for &rid in &refs {
            let Ok(hardpoint) = self.refs.definition(rid, key) else {
                continue;
            };
            static_key = hardpoint.key;
            match self.refs.slot_mut(rid, hardpoint.key) {
                Some(Slot::Pending(pending)) => pending.tasks.push(id),
                _ => self.refs.set_slot(
                    rid,
                    hardpoint.key,
                    Slot::Pending(Pending {
                        tasks: vec![id],
                        partial: Value::empty(hardpoint.cardinality),
                        error: None,
                    }),
                ),
            }
        }

        self.tasks.insert(
            id,
            Task {
                producer: producer.name(),
                key: static_key,
                refs: refs.clone(),
                future: None,
                waker: TaskWaker::waker(id, &self.ready),
                dependents: Vec::new(),
                started: Instant::now(),
            },
        );

        NewTask {
            id,
            producer: index,
            refs,
            key: static_key,
        }
    }

    /// Makes a request wait for every task still computing its hardpoint.
    fn subscribe(&mut self, rid: RequestId, key: &str) {
        let Some(request) = self.requests.get(&rid) else {
            return;
        };

        let mut awaiting = BTreeSet::new();
        let mut failure = None;
        for &id in &request.refs {
            if let Some(Slot::Pending(pending)) = self.refs.slot(id, key) {
                failure = failure.or_else(|| pending.error.clone());
                awaiting.extend(pending.tasks.iter().copied());
            }
        }

        // A contributing task already failed, the slot can not resolve.
        if let Some(error) = failure {
            self.settle(rid, Err(error));
            return;
        }

        for task in &awaiting {
            if let Some(task) = self.tasks.get_mut(task) {
                task.dependents.push(rid);
            }
        }

        let complete = awaiting.is_empty();
        if let Some(request) = self.requests.get_mut(&rid) {
            request.awaiting = awaiting;
        }
        if complete {
            self.settle(rid, Ok(()));
        }
    }

    /// Records the outcome of a request and wakes whoever waits on it. Only
    /// the first outcome counts.
    pub(crate) fn settle(&mut self, rid: RequestId, outcome: Result<(), SharedError>) {
        let Some(request) = self.requests.get_mut(&rid) else {
            return;
        };
        if request.outcome.is_some() {
            return;
        }
        request.outcome = Some(outcome);
        if let Some(waker) = request.waker.take() {
            waker.wake();
        }
    }

    /// Writes back the result of a finished task.
    pub(crate) fn complete(&mut self, id: TaskId, result: anyhow::Result<ResultMap>) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };

        let result = result.and_then(|map| {
            match map.keys().find(|key| !task.refs.contains(key)) {
                Some(&stray) => Err(anyhow!(EngineError::BadRefKey {
                    producer: task.producer,
                    id: stray,
                })),
                None => Ok(map),
            }
        });

        let duration = task.started.elapsed();
        self.diagnostics.executions.push(TaskExecution {
            producer: task.producer,
            hardpoint: task.key,
            refs: task.refs.len(),
            start: task.started.saturating_duration_since(self.epoch),
            duration,
            failed: result.is_err(),
        });

        match result {
            Ok(mut map) => {
                tracing::debug!(
                    producer = task.producer,
                    key = task.key,
                    refs = task.refs.len(),
                    ?duration,
                    "task finished"
                );
                for &rid in &task.refs {
                    let value = map.remove(&rid).unwrap_or_default();
                    self.contribute(rid, task.key, id, Ok(value));
                }
                for rid in task.dependents {
                    let complete = match self.requests.get_mut(&rid) {
                        Some(request) => {
                            request.awaiting.remove(&id);
                            request.awaiting.is_empty()
                        }
                        None => false,
                    };
                    if complete {
                        self.settle(rid, Ok(()));
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    producer = task.producer,
                    key = task.key,
                    refs = task.refs.len(),
                    "task failed: {err:#}"
                );
                let error = SharedError::new(err.context(format!(
                    "Producer '{}' failed while loading hardpoint \"{}\"",
                    task.producer, task.key
                )));
                for &rid in &task.refs {
                    self.contribute(rid, task.key, id, Err(error.clone()));
                }
                for rid in task.dependents {
                    self.settle(rid, Err(error.clone()));
                }
            }
        }
    }

    /// Folds one task's share into a pending slot. The slot resolves once
    /// every contributing task is done, or goes back to unrequested if any
    /// of them failed.
    fn contribute(
        &mut self,
        rid: RefId,
        key: &'static str,
        task: TaskId,
        value: Result<Value, SharedError>,
    ) {
        let Ok(hardpoint) = self.refs.definition(rid, key) else {
            return;
        };
        let Some(Slot::Pending(pending)) = self.refs.slot_mut(rid, key) else {
            return;
        };

        pending.tasks.retain(|other| *other != task);
        match value {
            Ok(value) => pending.partial.merge(hardpoint.cardinality, value),
            Err(error) => {
                pending.error.get_or_insert(error);
            }
        }

        if !pending.tasks.is_empty() {
            return;
        }

        let failed = pending.error.is_some();
        let value = std::mem::take(&mut pending.partial);
        self.refs.clear_slot(rid, key);
        if !failed {
            // The slot was pending a moment ago, so it can not be attached.
            let _ = self.refs.attach(rid, key, value);
        }
    }

    /// Describes tasks that are blocked and, if the tasks wait on each other
    /// in a circle, one such circle.
    pub(crate) fn blocked_report(&self) -> (String, Option<String>) {
        use petgraph::graph::{DiGraph, NodeIndex};

        let mut graph = DiGraph::<TaskId, ()>::new();
        let mut nodes: HashMap<TaskId, NodeIndex> = HashMap::new();

        let mut ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.sort();
        for id in &ids {
            nodes.insert(*id, graph.add_node(*id));
        }

        for request in self.requests.values() {
            if request.outcome.is_some() {
                continue;
            }
            let Some(waiting) = request.task.and_then(|task| nodes.get(&task)) else {
                continue;
            };
            for awaited in &request.awaiting {
                if let Some(target) = nodes.get(awaited) {
                    graph.update_edge(*waiting, *target, ());
                }
            }
        }

        let blocked = ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|task| format!("  - {}", task.label()))
            .collect::<Vec<_>>()
            .join("\n");

        let cycle = petgraph::algo::tarjan_scc(&graph)
            .into_iter()
            .find(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut labels: Vec<String> = component
                    .iter()
                    .filter_map(|node| self.tasks.get(&graph[*node]))
                    .map(Task::label)
                    .collect();
                labels.sort();
                if let Some(first) = labels.first().cloned() {
                    labels.push(first);
                }
                labels.join(" -> ")
            });

        (blocked, cycle)
    }
}
