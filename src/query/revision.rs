use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Value as Json, json};

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::future::{next_cursor, with_cursor};
use crate::producer::{Applicability, Query, ResultMap, TaskFuture};
use crate::query::{call, has_conduit, search, unique};
use crate::refs::{BuildableRef, ObjectKind, ObjectSymbolRef, Ref, RevisionRef};

const PARENT_EDGE: &str = "revision.parent";

/// Parent revisions, through the revision dependency edges.
#[derive(Debug, Default)]
pub struct RevisionParentsQuery;

impl Applicability for RevisionParentsQuery {
    fn name(&self) -> &'static str {
        "revision-parents"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[RevisionRef::PARENT_REVISIONS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<RevisionRef>()
    }
}

impl Query for RevisionParentsQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let children: Vec<(RefId, String)> = refs
                .iter()
                .filter_map(|&id| cx.with_ref(id, |r: &RevisionRef| (id, r.phid().to_string())))
                .collect();
            let sources = unique(children.iter().map(|(_, phid)| phid.clone()));

            // edge.search pages with a cursor but is no `*.search` method.
            let mut edges = Vec::new();
            let mut after = None;
            loop {
                let params = with_cursor(
                    json!({ "sourcePHIDs": sources, "types": [PARENT_EDGE] }),
                    after.take(),
                );
                let page = call(&cx, "edge.search", params)?.await?;
                if let Some(data) = page.get("data").and_then(Json::as_array) {
                    edges.extend(data.iter().cloned());
                }
                match next_cursor(&page) {
                    Some(next) => after = Some(next),
                    None => break,
                }
            }

            if edges.is_empty() {
                return Ok(ResultMap::new());
            }

            // child PHID -> parent PHIDs, in edge order.
            let mut parents: HashMap<String, Vec<String>> = HashMap::new();
            for edge in &edges {
                let (Some(src), Some(dst)) = (
                    edge.get("sourcePHID").and_then(Json::as_str),
                    edge.get("destinationPHID").and_then(Json::as_str),
                ) else {
                    continue;
                };
                parents.entry(src.to_string()).or_default().push(dst.to_string());
            }

            let targets = unique(parents.values().flatten().cloned());
            let symbols: Vec<RefId> = targets
                .iter()
                .map(|phid| cx.insert(ObjectSymbolRef::from_phid(ObjectKind::Revision, phid)))
                .collect();
            let resolved = cx.hardpoints(&symbols, ObjectSymbolRef::OBJECT).await?;

            let by_phid: HashMap<&str, RefId> = targets
                .iter()
                .zip(&resolved)
                .filter_map(|(phid, value)| Some((phid.as_str(), value.as_ref_id()?)))
                .collect();

            Ok(children
                .into_iter()
                .map(|(id, phid)| {
                    let list = parents
                        .get(&phid)
                        .into_iter()
                        .flatten()
                        .filter_map(|parent| by_phid.get(parent.as_str()).copied());
                    (id, Value::refs(list))
                })
                .collect())
        })
    }
}

/// The buildable of a revision's active diff.
#[derive(Debug, Default)]
pub struct RevisionBuildableQuery;

impl Applicability for RevisionBuildableQuery {
    fn name(&self) -> &'static str {
        "revision-buildable"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[RevisionRef::BUILDABLE]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<RevisionRef>()
    }
}

impl Query for RevisionBuildableQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let diffs: Vec<(RefId, String)> = refs
                .iter()
                .filter_map(|&id| {
                    cx.with_ref(id, |r: &RevisionRef| Some((id, r.diff_phid()?.to_string())))
                        .flatten()
                })
                .collect();
            if diffs.is_empty() {
                return Ok(ResultMap::new());
            }

            let phids = unique(diffs.iter().map(|(_, phid)| phid.clone()));
            let data = search(
                &cx,
                "harbormaster.buildable.search",
                json!({ "objectPHIDs": phids }),
            )?
            .await?;

            let mut by_object = HashMap::new();
            for entry in &data {
                let Some(buildable) = BuildableRef::from_conduit(entry) else {
                    continue;
                };
                let Some(object) = buildable.object_phid().map(str::to_string) else {
                    continue;
                };
                by_object.insert(object, cx.insert(buildable));
            }

            Ok(diffs
                .into_iter()
                .filter_map(|(id, diff)| Some((id, Value::Ref(*by_object.get(&diff)?))))
                .collect())
        })
    }
}
