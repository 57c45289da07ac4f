use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::json;

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::producer::{Applicability, Loader, Query, ResultMap, TaskFuture};
use crate::query::{has_conduit, search, unique};
use crate::refs::{BuildPlanRef, BuildRef, BuildableRef, Ref};

#[derive(Debug, Default)]
pub struct BuildableBuildsQuery;

impl Applicability for BuildableBuildsQuery {
    fn name(&self) -> &'static str {
        "buildable-builds"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BuildableRef::BUILDS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<BuildableRef>()
    }
}

impl Query for BuildableBuildsQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let buildables: HashMap<String, RefId> = refs
                .iter()
                .filter_map(|&id| cx.with_ref(id, |b: &BuildableRef| (b.phid().to_string(), id)))
                .collect();
            if buildables.is_empty() {
                return Ok(ResultMap::new());
            }

            let phids = unique(buildables.keys().cloned());
            let data = search(&cx, "harbormaster.build.search", json!({ "buildables": phids }))?.await?;

            let mut builds: BTreeMap<RefId, Vec<RefId>> = BTreeMap::new();
            for entry in &data {
                let Some(build) = BuildRef::from_conduit(entry) else {
                    continue;
                };
                let Some(&owner) = build.buildable_phid().and_then(|phid| buildables.get(phid)) else {
                    continue;
                };
                builds.entry(owner).or_default().push(cx.insert(build));
            }

            Ok(builds
                .into_iter()
                .map(|(id, list)| (id, Value::refs(list)))
                .collect())
        })
    }
}

#[derive(Debug, Default)]
pub struct BuildPlanQuery;

impl Applicability for BuildPlanQuery {
    fn name(&self) -> &'static str {
        "build-plan"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BuildRef::BUILD_PLAN]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<BuildRef>()
    }
}

impl Query for BuildPlanQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let wanted: Vec<(RefId, String)> = refs
                .iter()
                .filter_map(|&id| {
                    cx.with_ref(id, |b: &BuildRef| Some((id, b.plan_phid()?.to_string())))
                        .flatten()
                })
                .collect();
            if wanted.is_empty() {
                return Ok(ResultMap::new());
            }

            let phids = unique(wanted.iter().map(|(_, phid)| phid.clone()));
            let data = search(&cx, "harbormaster.buildplan.search", json!({ "phids": phids }))?.await?;

            let plans: HashMap<String, RefId> = data
                .iter()
                .filter_map(BuildPlanRef::from_conduit)
                .map(|plan| (plan.phid().to_string(), cx.insert(plan)))
                .collect();

            Ok(wanted
                .into_iter()
                .filter_map(|(id, phid)| Some((id, Value::Ref(*plans.get(&phid)?))))
                .collect())
        })
    }
}

/// Folds the builds of a buildable into one status word.
#[derive(Debug, Default)]
pub struct BuildableStatusLoader;

impl Applicability for BuildableStatusLoader {
    fn name(&self) -> &'static str {
        "buildable-status"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BuildableRef::STATUS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<BuildableRef>()
    }
}

impl Loader for BuildableStatusLoader {
    fn requires(&self) -> &'static [&'static str] {
        &[BuildableRef::BUILDS]
    }

    fn load(
        &self,
        cx: &QueryContext,
        refs: &[RefId],
        _hardpoint: &'static str,
    ) -> anyhow::Result<ResultMap> {
        let mut map = ResultMap::new();
        for &id in refs {
            let builds: Vec<BuildRef> = cx
                .value(id, BuildableRef::BUILDS)?
                .ref_ids()
                .into_iter()
                .filter_map(|build| cx.read::<BuildRef>(build))
                .collect();
            if let Some(status) = aggregate_status(&builds) {
                map.insert(id, Value::Text(status.to_string()));
            }
        }
        Ok(map)
    }
}

fn aggregate_status(builds: &[BuildRef]) -> Option<&'static str> {
    if builds.is_empty() {
        return None;
    }
    if builds.iter().any(|b| b.is_complete() && !b.is_passed()) {
        return Some("failed");
    }
    if builds.iter().all(BuildRef::is_passed) {
        return Some("passed");
    }
    Some("building")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value as Json, json};

    use super::*;
    use crate::core::Config;
    use crate::engine::Engine;
    use crate::producer::Producer;
    use crate::testing::FakeConduit;

    fn build(id: u64, buildable: &str, status: &str) -> Json {
        json!({
            "id": id,
            "phid": format!("PHID-HMBD-{id}"),
            "fields": {
                "buildablePHID": buildable,
                "buildPlanPHID": "PHID-HMCP-1",
                "buildStatus": { "value": status },
            },
        })
    }

    fn engine(conduit: Arc<FakeConduit>) -> Engine {
        let env = Environment::new(Config::default()).with_conduit(conduit);
        Engine::builder(env)
            .producer(Producer::query(BuildableBuildsQuery))
            .producer(Producer::query(BuildPlanQuery))
            .producer(Producer::loader(BuildableStatusLoader))
            .build()
            .unwrap()
    }

    #[test]
    fn test_aggregate_status() {
        let refs = |statuses: &[&str]| -> Vec<BuildRef> {
            statuses
                .iter()
                .enumerate()
                .filter_map(|(i, s)| BuildRef::from_conduit(&build(i as u64, "PHID-HMBB-1", s)))
                .collect()
        };

        assert_eq!(aggregate_status(&refs(&[])), None);
        assert_eq!(aggregate_status(&refs(&["passed", "passed"])), Some("passed"));
        assert_eq!(aggregate_status(&refs(&["passed", "building"])), Some("building"));
        assert_eq!(aggregate_status(&refs(&["building", "failed"])), Some("failed"));
    }

    #[test]
    fn test_status_loads_builds_first() {
        let conduit = FakeConduit::new();
        conduit.respond("harbormaster.build.search", |_| {
            Ok(json!({
                "data": [
                    build(1, "PHID-HMBB-1", "passed"),
                    build(2, "PHID-HMBB-1", "failed"),
                    build(3, "PHID-HMBB-2", "passed"),
                ],
                "cursor": { "after": null },
            }))
        });
        conduit.respond("harbormaster.buildplan.search", |_| {
            Ok(json!({
                "data": [{ "id": 1, "phid": "PHID-HMCP-1", "fields": { "name": "Unit tests" } }],
                "cursor": { "after": null },
            }))
        });

        let mut engine = engine(Arc::clone(&conduit));
        let one = engine.insert(BuildableRef::new(1, "PHID-HMBB-1"));
        let two = engine.insert(BuildableRef::new(2, "PHID-HMBB-2"));
        let three = engine.insert(BuildableRef::new(3, "PHID-HMBB-3"));

        engine
            .resolve(&[one, two, three], &[BuildableRef::STATUS])
            .unwrap();

        let status = |id| engine.hardpoint(id, BuildableRef::STATUS).unwrap();
        assert_eq!(status(one), Value::Text("failed".to_string()));
        assert_eq!(status(two), Value::Text("passed".to_string()));
        assert!(status(three).is_absent());
        // The builds of all three came from one call.
        assert_eq!(conduit.calls("harbormaster.build.search"), 1);

        let builds = engine.hardpoint(one, BuildableRef::BUILDS).unwrap().ref_ids();
        engine.resolve(&builds, &[BuildRef::BUILD_PLAN]).unwrap();

        let plan = engine
            .hardpoint(builds[0], BuildRef::BUILD_PLAN)
            .unwrap()
            .as_ref_id()
            .unwrap();
        assert_eq!(engine.get::<BuildPlanRef>(plan).unwrap().name(), "Unit tests");
        assert_eq!(conduit.calls("harbormaster.buildplan.search"), 1);
    }
}
