use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::{Value as Json, json};

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::future::{ConduitSearch, OpFuture};
use crate::producer::{Applicability, Query, ResultMap, TaskFuture};
use crate::query::{call, has_conduit, search, unique};
use crate::refs::{ObjectKind, ObjectRef, ObjectSymbolRef, Ref, RevisionRef, SymbolType};

/// Key under which a loaded object can be found again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Lookup {
    Id(ObjectKind, String),
    Phid(String),
    Username(String),
    Viewer,
}

impl Lookup {
    fn of(symbol: &ObjectSymbolRef) -> Self {
        match symbol.symbol_type() {
            SymbolType::Id => Lookup::Id(symbol.kind(), symbol.symbol().to_string()),
            SymbolType::Phid => Lookup::Phid(symbol.symbol().to_string()),
            SymbolType::Username => Lookup::Username(symbol.symbol().to_lowercase()),
            SymbolType::Function => Lookup::Viewer,
        }
    }
}

fn symbols(cx: &QueryContext, refs: &[RefId]) -> Vec<(RefId, ObjectSymbolRef)> {
    refs.iter()
        .filter_map(|&id| Some((id, cx.read::<ObjectSymbolRef>(id)?)))
        .collect()
}

fn results(symbols: &[(RefId, ObjectSymbolRef)], found: &HashMap<Lookup, RefId>) -> ResultMap {
    symbols
        .iter()
        .filter_map(|(id, symbol)| Some((*id, Value::Ref(*found.get(&Lookup::of(symbol))?))))
        .collect()
}

/// Stores a search result as the ref type for its kind.
fn insert_object(cx: &QueryContext, kind: ObjectKind, data: &Json) -> Option<(RefId, Option<u64>, String)> {
    match kind {
        ObjectKind::Revision => {
            let revision = RevisionRef::from_search(data)?;
            let (id, phid) = (revision.id(), revision.phid().to_string());
            Some((cx.insert(revision), Some(id), phid))
        }
        _ => {
            let object = ObjectRef::from_conduit(kind, data)?;
            let (id, phid) = (object.id(), object.phid().to_string());
            Some((cx.insert(object), id, phid))
        }
    }
}

/// Revisions, files and pastes named by id or PHID.
#[derive(Debug, Default)]
pub struct SimpleSymbolQuery;

impl Applicability for SimpleSymbolQuery {
    fn name(&self) -> &'static str {
        "object-symbol"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[ObjectSymbolRef::OBJECT]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object
            .downcast_ref::<ObjectSymbolRef>()
            .is_some_and(|symbol| symbol.kind() != ObjectKind::User)
    }
}

impl Query for SimpleSymbolQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let symbols = symbols(&cx, &refs);
            let conduit = cx.conduit()?;

            // kind -> (ids, phids)
            let mut wanted: BTreeMap<ObjectKind, (Vec<u64>, Vec<String>)> = BTreeMap::new();
            for (_, symbol) in &symbols {
                let entry = wanted.entry(symbol.kind()).or_default();
                match symbol.symbol_type() {
                    SymbolType::Id => {
                        if let Ok(id) = symbol.symbol().parse() {
                            entry.0.push(id);
                        }
                    }
                    SymbolType::Phid => entry.1.push(symbol.symbol().to_string()),
                    _ => {}
                }
            }

            let mut kinds = Vec::new();
            let mut ops: Vec<OpFuture<Vec<Json>>> = Vec::new();
            for (kind, (ids, phids)) in wanted {
                let ids = unique(ids);
                let phids = unique(phids);
                if !ids.is_empty() {
                    kinds.push(kind);
                    ops.push(
                        ConduitSearch::new(conduit.clone(), kind.search_method(), json!({ "ids": ids }))
                            .boxed(),
                    );
                }
                if !phids.is_empty() {
                    kinds.push(kind);
                    ops.push(
                        ConduitSearch::new(conduit.clone(), kind.search_method(), json!({ "phids": phids }))
                            .boxed(),
                    );
                }
            }

            let mut found = HashMap::new();
            for (kind, result) in kinds.into_iter().zip(cx.futures(ops).await) {
                for data in result? {
                    let Some((rid, id, phid)) = insert_object(&cx, kind, &data) else {
                        continue;
                    };
                    if let Some(id) = id {
                        found.insert(Lookup::Id(kind, id.to_string()), rid);
                    }
                    found.insert(Lookup::Phid(phid), rid);
                }
            }

            Ok(results(&symbols, &found))
        })
    }
}

/// Users named by PHID, username or `viewer()`.
#[derive(Debug, Default)]
pub struct UserSymbolQuery;

impl Applicability for UserSymbolQuery {
    fn name(&self) -> &'static str {
        "user-symbol"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[ObjectSymbolRef::OBJECT]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object
            .downcast_ref::<ObjectSymbolRef>()
            .is_some_and(|symbol| symbol.kind() == ObjectKind::User)
    }
}

impl Query for UserSymbolQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let symbols = symbols(&cx, &refs);
            let method = ObjectKind::User.search_method();

            let of_type = |kind: SymbolType| {
                unique(
                    symbols
                        .iter()
                        .filter(|(_, symbol)| symbol.symbol_type() == kind)
                        .map(|(_, symbol)| symbol.symbol().to_string()),
                )
            };
            let phids = of_type(SymbolType::Phid);
            let usernames = of_type(SymbolType::Username);
            let viewer = symbols
                .iter()
                .any(|(_, symbol)| symbol.symbol_type() == SymbolType::Function);

            // Everything is submitted before the first await.
            let by_phid = if phids.is_empty() {
                None
            } else {
                Some(search(&cx, method, json!({ "phids": phids }))?)
            };
            let by_name = if usernames.is_empty() {
                None
            } else {
                Some(search(&cx, method, json!({ "usernames": usernames }))?)
            };
            let whoami = if viewer {
                Some(call(&cx, "user.whoami", json!({}))?)
            } else {
                None
            };

            let mut users = Vec::new();
            if let Some(handle) = by_phid {
                users.extend(handle.await?);
            }
            if let Some(handle) = by_name {
                users.extend(handle.await?);
            }

            let mut found = HashMap::new();
            for data in &users {
                let Some(user) = ObjectRef::from_conduit(ObjectKind::User, data) else {
                    continue;
                };
                let username = user
                    .fields()
                    .get("username")
                    .and_then(Json::as_str)
                    .map(str::to_lowercase);
                let phid = user.phid().to_string();
                let rid = cx.insert(user);
                if let Some(username) = username {
                    found.insert(Lookup::Username(username), rid);
                }
                found.insert(Lookup::Phid(phid), rid);
            }

            if let Some(handle) = whoami {
                let me = handle.await?;
                if let Some(user) = ObjectRef::from_conduit(ObjectKind::User, &whoami_as_search(&me)) {
                    found.insert(Lookup::Viewer, cx.insert(user));
                }
            }

            Ok(results(&symbols, &found))
        })
    }
}

/// `user.whoami` reports a flat record; reshape it like a `user.search` entry.
fn whoami_as_search(me: &Json) -> Json {
    json!({
        "phid": me.get("phid"),
        "fields": {
            "username": me.get("userName"),
            "realName": me.get("realName"),
        },
    })
}
