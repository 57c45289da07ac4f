use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::bail;

use super::*;
use crate::core::{Config, Hardpoint};
use crate::producer::{Applicability, Loader, Query, ResultMap, TaskFuture};
use crate::refs::HardpointState;
use crate::testing::delay;

#[derive(Debug, Clone)]
struct Thing {
    name: String,
}

impl Thing {
    const HARDPOINTS: &'static [Hardpoint] = &[
        Hardpoint::single("label"),
        Hardpoint::list("tags"),
        Hardpoint::map("meta"),
        Hardpoint::single("shout"),
        Hardpoint::single("boom"),
        Hardpoint::single("echo"),
        Hardpoint::single("ring"),
        Hardpoint::single("bell"),
        Hardpoint::single("silent"),
    ];

    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Ref for Thing {
    fn ref_type(&self) -> &'static str {
        "thing"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn identity(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Body = Box<dyn Fn(QueryContext, Vec<RefId>, &'static str) -> TaskFuture>;

/// A query whose body is a closure.
struct Scripted {
    name: &'static str,
    keys: &'static [&'static str],
    env: bool,
    only: Option<&'static str>,
    body: Body,
}

impl Scripted {
    fn new<F>(name: &'static str, keys: &'static [&'static str], body: F) -> Self
    where
        F: Fn(QueryContext, Vec<RefId>, &'static str) -> TaskFuture + 'static,
    {
        Self {
            name,
            keys,
            env: true,
            only: None,
            body: Box::new(body),
        }
    }

    /// Applies to the thing called `name` only.
    fn only(mut self, name: &'static str) -> Self {
        self.only = Some(name);
        self
    }

    fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    fn producer(self) -> Producer {
        Producer::query(self)
    }
}

impl Applicability for Scripted {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        self.keys
    }

    fn can_apply_env(&self, _env: &Environment) -> bool {
        self.env
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object
            .downcast_ref::<Thing>()
            .is_some_and(|thing| self.only.is_none_or(|name| thing.name == name))
    }
}

impl Query for Scripted {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        hardpoint: &'static str,
    ) -> TaskFuture {
        (self.body)(cx, refs, hardpoint)
    }
}

/// Upper-cases another single hardpoint of the same ref.
struct Upper {
    name: &'static str,
    key: &'static [&'static str],
    from: &'static [&'static str],
}

impl Applicability for Upper {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        self.key
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<Thing>()
    }
}

impl Loader for Upper {
    fn requires(&self) -> &'static [&'static str] {
        self.from
    }

    fn load(&self, cx: &QueryContext, refs: &[RefId], _hardpoint: &'static str) -> anyhow::Result<ResultMap> {
        let mut map = ResultMap::new();
        for &id in refs {
            if let Some(text) = cx.value(id, self.from[0])?.as_text() {
                map.insert(id, Value::Text(text.to_uppercase()));
            }
        }
        Ok(map)
    }
}

type Batches = Rc<RefCell<Vec<usize>>>;

fn names(cx: &QueryContext, refs: &[RefId]) -> Vec<(RefId, String)> {
    refs.iter()
        .filter_map(|&id| cx.with_ref(id, |thing: &Thing| (id, thing.name.clone())))
        .collect()
}

/// Fills `label` with one sleeping operation per ref. `ghost` gets nothing.
fn labels(batches: Batches, wait: Duration) -> Scripted {
    Scripted::new("labels", &["label"], move |cx, refs, _| -> TaskFuture {
        batches.borrow_mut().push(refs.len());
        Box::pin(async move {
            let named = names(&cx, &refs);
            let ops = named
                .iter()
                .map(|(_, name)| delay(wait, format!("label:{name}")));
            let results = cx.futures(ops).await;

            let mut map = ResultMap::new();
            for ((id, name), result) in named.iter().zip(results) {
                let text = result?;
                if name != "ghost" {
                    map.insert(*id, Value::Text(text));
                }
            }
            Ok(map)
        })
    })
}

fn tags(name: &'static str, wait: Duration) -> Scripted {
    Scripted::new(name, &["tags"], move |cx, refs, _| -> TaskFuture {
        Box::pin(async move {
            cx.future(delay(wait, ())).await?;

            Ok(names(&cx, &refs)
                .into_iter()
                .filter(|(_, thing)| thing != "ghost")
                .map(|(id, thing)| (id, Value::List(vec![Value::Text(format!("{name}:{thing}"))])))
                .collect())
        })
    })
}

fn engine(producers: impl IntoIterator<Item = Producer>) -> Engine {
    let config = Config {
        poll_interval_ms: 5,
        ..Config::default()
    };
    Engine::builder(Environment::new(config))
        .producers(producers)
        .build()
        .unwrap()
}

fn text(engine: &Engine, id: RefId, key: &str) -> Option<String> {
    engine
        .hardpoint(id, key)
        .unwrap()
        .as_text()
        .map(str::to_string)
}

#[test]
fn test_resolution_is_memoized() {
    let batches = Batches::default();
    let mut engine = engine([labels(batches.clone(), Duration::ZERO).producer()]);
    let a = engine.insert(Thing::new("a"));

    engine.resolve(&[a], &["label"]).unwrap();
    let operations = engine.diagnostics().operations;
    engine.resolve(&[a], &["label"]).unwrap();
    engine.resolve(&[a, a], &["label"]).unwrap();

    assert_eq!(text(&engine, a, "label").as_deref(), Some("label:a"));
    assert_eq!(*batches.borrow(), vec![1]);
    assert_eq!(engine.diagnostics().operations, operations);
    assert_eq!(engine.diagnostics().tasks(), 1);
}

#[test]
fn test_first_applicable_producer_wins() {
    let unused = Batches::default();
    let batches = Batches::default();
    let mut engine = engine([
        labels(unused.clone(), Duration::ZERO).without_env().producer(),
        labels(unused.clone(), Duration::ZERO).only("zzz").producer(),
        labels(batches.clone(), Duration::ZERO).producer(),
        labels(unused.clone(), Duration::ZERO).producer(),
    ]);
    assert_eq!(engine.producers().len(), 3);

    let a = engine.insert(Thing::new("a"));
    let b = engine.insert(Thing::new("b"));
    engine.resolve(&[a, b], &["label"]).unwrap();

    assert_eq!(text(&engine, b, "label").as_deref(), Some("label:b"));
    assert_eq!(*batches.borrow(), vec![2]);
    assert!(unused.borrow().is_empty());
}

#[test]
fn test_list_hardpoints_merge_every_producer() {
    let mut engine = engine([
        tags("red", Duration::ZERO).producer(),
        tags("blue", Duration::ZERO).only("a").producer(),
    ]);
    let a = engine.insert(Thing::new("a"));
    let b = engine.insert(Thing::new("b"));

    engine.resolve(&[a, b], &["tags"]).unwrap();

    let mut found: Vec<String> = engine
        .hardpoint(a, "tags")
        .unwrap()
        .as_list()
        .iter()
        .filter_map(|value| value.as_text().map(str::to_string))
        .collect();
    found.sort();
    assert_eq!(found, ["blue:a", "red:a"]);
    assert_eq!(engine.hardpoint(b, "tags").unwrap().as_list().len(), 1);
}

#[test]
fn test_missing_results_resolve_empty() {
    let meta = Scripted::new("meta", &["meta"], |_, _, _| -> TaskFuture {
        Box::pin(async { Ok(ResultMap::new()) })
    });
    let mut engine = engine([
        labels(Batches::default(), Duration::ZERO).producer(),
        tags("red", Duration::ZERO).producer(),
        meta.producer(),
    ]);
    let ghost = engine.insert(Thing::new("ghost"));

    engine.resolve(&[ghost], &["label", "tags", "meta"]).unwrap();

    assert_eq!(engine.hardpoint(ghost, "label").unwrap(), Value::Absent);
    assert_eq!(engine.hardpoint(ghost, "tags").unwrap(), Value::List(Vec::new()));
    assert_eq!(engine.hardpoint(ghost, "meta").unwrap(), Value::Map(Default::default()));
}

#[test]
fn test_independent_work_runs_concurrently() {
    let delay = Duration::from_millis(100);
    let mut engine = engine([
        labels(Batches::default(), delay).producer(),
        tags("red", delay).producer(),
        tags("blue", delay).producer(),
    ]);
    let refs: Vec<RefId> = ["a", "b", "c"]
        .into_iter()
        .map(|name| engine.insert(Thing::new(name)))
        .collect();

    let s = Instant::now();
    engine.resolve(&refs, &["label", "tags"]).unwrap();

    assert!(s.elapsed() < Duration::from_millis(180), "took {:?}", s.elapsed());
    assert_eq!(engine.diagnostics().operations, 5);
}

#[test]
fn test_loader_batches_its_requirements() {
    let batches = Batches::default();
    let mut engine = engine([
        labels(batches.clone(), Duration::from_millis(10)).producer(),
        Producer::loader(Upper {
            name: "shout",
            key: &["shout"],
            from: &["label"],
        }),
    ]);
    let refs: Vec<RefId> = ["a", "b", "c"]
        .into_iter()
        .map(|name| engine.insert(Thing::new(name)))
        .collect();

    engine.resolve(&refs, &["shout"]).unwrap();

    assert_eq!(text(&engine, refs[0], "shout").as_deref(), Some("LABEL:A"));
    assert_eq!(text(&engine, refs[2], "label").as_deref(), Some("label:c"));
    // One nested batch for all three refs.
    assert_eq!(*batches.borrow(), vec![3]);
}

#[test]
fn test_failure_reverts_and_spares_unrelated_work() {
    let batches = Batches::default();
    let boom = Scripted::new("boom", &["boom"], move |cx, refs, _| -> TaskFuture {
        batches.borrow_mut().push(refs.len());
        Box::pin(async move {
            if names(&cx, &refs).iter().any(|(_, name)| name == "bad") {
                bail!("refused to go off");
            }
            Ok(ResultMap::new())
        })
    });
    let mut engine = engine([
        labels(Batches::default(), Duration::ZERO).producer(),
        boom.producer(),
        Producer::loader(Upper {
            name: "echo",
            key: &["echo"],
            from: &["boom"],
        }),
    ]);
    let refs: Vec<RefId> = ["a", "bad", "c"]
        .into_iter()
        .map(|name| engine.insert(Thing::new(name)))
        .collect();

    let err = engine.resolve(&refs, &["label", "echo"]).unwrap_err();

    assert!(matches!(err, EngineError::Failed(_)));
    let message = format!("{err:#}");
    assert!(message.contains("'echo'"), "{message}");
    assert!(message.contains("'boom'"), "{message}");
    assert!(message.contains("refused to go off"), "{message}");

    for &id in &refs {
        let name = engine.get::<Thing>(id).unwrap().name;
        assert_eq!(text(&engine, id, "label").unwrap(), format!("label:{name}"));
        assert_eq!(engine.refs().state(id, "boom").unwrap(), HardpointState::Unrequested);
        assert_eq!(engine.refs().state(id, "echo").unwrap(), HardpointState::Unrequested);
    }
    assert_eq!(engine.diagnostics().failures(), 2);
}

#[test]
fn test_request_after_a_failure_gets_the_error() {
    let failing = Scripted::new("failing", &["tags"], |_, refs, _| -> TaskFuture {
        Box::pin(async move {
            if !refs.is_empty() {
                bail!("no tags today");
            }
            Ok(ResultMap::new())
        })
    });
    let seen: Rc<RefCell<Option<Result<(), String>>>> = Rc::default();
    let record = seen.clone();
    // Asks for tags after "failing" is done but while "slow" still runs.
    let late = Scripted::new("late", &["label"], move |cx, refs, _| -> TaskFuture {
        let record = record.clone();
        Box::pin(async move {
            cx.future(delay(Duration::from_millis(20), ())).await?;
            let outcome = cx.request(&refs, "tags").await;
            *record.borrow_mut() = Some(outcome.map_err(|err| format!("{err:#}")));
            Ok(ResultMap::new())
        })
    });
    let mut engine = engine([
        failing.producer(),
        tags("slow", Duration::from_millis(60)).producer(),
        late.producer(),
    ]);
    let a = engine.insert(Thing::new("a"));

    let err = engine.resolve(&[a], &["tags", "label"]).unwrap_err();
    assert!(format!("{err:#}").contains("no tags today"));

    let message = seen.borrow().clone().unwrap().unwrap_err();
    assert!(message.contains("'failing'"), "{message}");
    assert!(message.contains("no tags today"), "{message}");
    assert_eq!(engine.refs().state(a, "tags").unwrap(), HardpointState::Unrequested);
    assert_eq!(engine.hardpoint(a, "label").unwrap(), Value::Absent);
}

#[test]
fn test_waiting_in_a_circle_stalls() {
    let ring = Scripted::new("ring", &["ring"], |cx, refs, _| -> TaskFuture {
        Box::pin(async move {
            cx.request(&refs, "bell").await?;
            Ok(ResultMap::new())
        })
    });
    let bell = Scripted::new("bell", &["bell"], |cx, refs, _| -> TaskFuture {
        Box::pin(async move {
            cx.request(&refs, "ring").await?;
            Ok(ResultMap::new())
        })
    });
    let mut engine = engine([ring.producer(), bell.producer()]);
    let a = engine.insert(Thing::new("a"));

    let err = engine.resolve(&[a], &["ring"]).unwrap_err();

    let (blocked, cycle) = match err {
        EngineError::Stalled { blocked, cycle, .. } => (blocked, cycle),
        other => panic!("expected a stall, got {other}"),
    };
    assert!(blocked.contains("'ring'") && blocked.contains("'bell'"), "{blocked}");
    let cycle = cycle.unwrap();
    assert!(cycle.contains("'ring'") && cycle.contains("'bell'"), "{cycle}");
    assert_eq!(engine.refs().state(a, "ring").unwrap(), HardpointState::Unrequested);
}

#[test]
fn test_panicking_producer_fails_its_task() {
    let bad = Scripted::new("bad", &["boom"], |_, refs, _| -> TaskFuture {
        Box::pin(async move {
            if !refs.is_empty() {
                panic!("kaboom");
            }
            Ok(ResultMap::new())
        })
    });
    let mut engine = engine([bad.producer(), labels(Batches::default(), Duration::ZERO).producer()]);
    let a = engine.insert(Thing::new("a"));

    let err = engine.resolve(&[a], &["boom", "label"]).unwrap_err();

    assert!(format!("{err:#}").contains("kaboom"));
    assert_eq!(text(&engine, a, "label").as_deref(), Some("label:a"));
}

#[test]
fn test_stray_result_key_is_rejected() {
    let stray = Scripted::new("stray", &["label"], |cx, _, _| -> TaskFuture {
        Box::pin(async move {
            let elsewhere = cx.insert(Thing::new("elsewhere"));
            Ok(QueryContext::value_map(&[elsewhere], Value::Text("lost".into())))
        })
    });
    let mut engine = engine([stray.producer()]);
    let a = engine.insert(Thing::new("a"));

    let err = engine.resolve(&[a], &["label"]).unwrap_err();

    assert!(format!("{err:#}").contains("not in its batch"));
    assert_eq!(engine.refs().state(a, "label").unwrap(), HardpointState::Unrequested);
}

#[test]
fn test_attached_values_skip_producers() {
    let batches = Batches::default();
    let mut engine = engine([labels(batches.clone(), Duration::ZERO).producer()]);
    let a = engine.insert(Thing::new("a"));
    let b = engine.insert(Thing::new("b"));

    engine.attach(a, "label", Value::Text("pinned".into())).unwrap();
    engine.resolve(&[a, b], &["label"]).unwrap();

    assert_eq!(text(&engine, a, "label").as_deref(), Some("pinned"));
    assert_eq!(text(&engine, b, "label").as_deref(), Some("label:b"));
    assert_eq!(*batches.borrow(), vec![1]);
    assert!(matches!(
        engine.attach(b, "label", Value::Absent),
        Err(EngineError::AlreadyAttached { .. })
    ));
}

#[test]
fn test_bad_requests_fail_before_anything_runs() {
    let mut engine = engine([labels(Batches::default(), Duration::ZERO).producer()]);
    let a = engine.insert(Thing::new("a"));

    assert!(matches!(
        engine.resolve(&[a], &["label", "silent"]),
        Err(EngineError::NoProducer { .. })
    ));
    assert!(matches!(
        engine.resolve(&[a], &["label", "nope"]),
        Err(EngineError::UnknownHardpoint { .. })
    ));
    assert_eq!(engine.diagnostics().tasks(), 0);
    assert_eq!(engine.refs().state(a, "label").unwrap(), HardpointState::Unrequested);
}
