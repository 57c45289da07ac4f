use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Value as Json, json};

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::producer::{Applicability, Loader, Query, ResultMap, TaskFuture};
use crate::query::{call, has_conduit, unique};
use crate::refs::{
    BrowseRef, BrowseType, BrowseUriRef, CommitRef, CommitSymbolRef, ObjectKind, ObjectSymbolRef,
    Ref, RevisionRef,
};

fn browse_refs(cx: &QueryContext, refs: &[RefId]) -> Vec<(RefId, BrowseRef)> {
    refs.iter()
        .filter_map(|&id| Some((id, cx.read::<BrowseRef>(id)?)))
        .collect()
}

fn supports(object: &dyn Ref, kind: BrowseType) -> bool {
    object
        .downcast_ref::<BrowseRef>()
        .is_some_and(|browse| browse.supports(kind))
}

/// One URI ref per target, grouped by the browse ref they belong to.
fn uri_results(cx: &QueryContext, uris: Vec<(RefId, BrowseType, String)>) -> ResultMap {
    let mut grouped: BTreeMap<RefId, Vec<RefId>> = BTreeMap::new();
    for (id, kind, uri) in uris {
        grouped
            .entry(id)
            .or_default()
            .push(cx.insert(BrowseUriRef::new(kind, uri)));
    }
    grouped
        .into_iter()
        .map(|(id, list)| (id, Value::refs(list)))
        .collect()
}

/// Commits named by browse tokens.
#[derive(Debug, Default)]
pub struct BrowseCommitQuery;

impl Applicability for BrowseCommitQuery {
    fn name(&self) -> &'static str {
        "browse-commits"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BrowseRef::COMMIT_REFS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        env.repository.is_some()
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        supports(object, BrowseType::Commit)
    }
}

impl Query for BrowseCommitQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let head = cx.repository()?.vcs().head_symbol();

            let mut symbols = Vec::new();
            for (id, browse) in browse_refs(&cx, &refs) {
                let token = match browse.token() {
                    // The current directory, never the commit it is on.
                    Some(".") => continue,
                    Some(token) => token,
                    None if browse.has_type(BrowseType::Commit) => head,
                    None => continue,
                };
                let Ok(symbol) = CommitSymbolRef::new(token) else {
                    continue;
                };
                symbols.push((id, cx.insert(symbol)));
            }
            if symbols.is_empty() {
                return Ok(ResultMap::new());
            }

            let targets = unique(symbols.iter().map(|(_, symbol)| *symbol));
            if let Err(err) = cx.request(&targets, CommitSymbolRef::OBJECT).await {
                // Tokens that are no commit are fine here.
                tracing::debug!("browse tokens did not resolve as commits: {err:#}");
                return Ok(ResultMap::new());
            }

            let mut map = ResultMap::new();
            for (id, symbol) in symbols {
                if let Some(commit) = cx.value(symbol, CommitSymbolRef::OBJECT)?.as_ref_id() {
                    map.insert(id, Value::refs([commit]));
                }
            }
            Ok(map)
        })
    }
}

/// Repository browser URIs for commits named by browse tokens.
#[derive(Debug, Default)]
pub struct BrowseCommitUriQuery;

impl Applicability for BrowseCommitUriQuery {
    fn name(&self) -> &'static str {
        "browse-commit-uris"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BrowseRef::URIS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        env.repository.is_some() && has_conduit(env) && env.remote.is_some()
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        supports(object, BrowseType::Commit)
    }
}

impl Query for BrowseCommitUriQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let Some(repository) = cx.remote().map(|remote| remote.phid().to_string()) else {
                return Ok(ResultMap::new());
            };

            let commits = cx.hardpoints(&refs, BrowseRef::COMMIT_REFS).await?;

            let mut hashes: Vec<(RefId, String)> = Vec::new();
            for (&id, value) in refs.iter().zip(&commits) {
                for commit in value.ref_ids() {
                    if let Some(hash) = cx.with_ref(commit, |c: &CommitRef| c.hash().to_string()) {
                        hashes.push((id, hash));
                    }
                }
            }
            if hashes.is_empty() {
                return Ok(ResultMap::new());
            }

            let names = unique(hashes.iter().map(|(_, hash)| hash.clone()));
            let info = call(
                &cx,
                "diffusion.querycommits",
                json!({ "repositoryPHID": repository, "names": names }),
            )?
            .await?;

            let uris = hashes
                .into_iter()
                .filter_map(|(id, hash)| {
                    let phid = info.pointer("/identifierMap")?.get(&hash)?.as_str()?;
                    let uri = info.get("data")?.get(phid)?.get("uri")?.as_str()?;
                    Some((id, BrowseType::Commit, uri.to_string()))
                })
                .collect();

            Ok(uri_results(&cx, uris))
        })
    }
}

/// Repository browser URIs for tokens naming a path in the working copy,
/// with an optional `$lines` suffix.
#[derive(Debug, Default)]
pub struct BrowsePathUriLoader;

impl Applicability for BrowsePathUriLoader {
    fn name(&self) -> &'static str {
        "browse-path-uris"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BrowseRef::URIS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        env.repository.is_some() && env.remote.is_some()
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        supports(object, BrowseType::Path)
    }
}

impl Loader for BrowsePathUriLoader {
    fn load(
        &self,
        cx: &QueryContext,
        refs: &[RefId],
        _hardpoint: &'static str,
    ) -> anyhow::Result<ResultMap> {
        let (Ok(api), Some(remote)) = (cx.repository(), cx.remote()) else {
            return Ok(ResultMap::new());
        };

        let mut uris = Vec::new();
        for (id, browse) in browse_refs(cx, refs) {
            let Some(token) = browse.token() else {
                continue;
            };
            let (path, lines) = match token.split_once('$') {
                Some((path, lines)) => (path, Some(lines)),
                None => (token, None),
            };

            let path = if path == "." { None } else { Some(path) };
            if let Some(path) = path
                && !api.path_exists(path)
            {
                continue;
            }

            uris.push((id, BrowseType::Path, remote.browse_uri(path, browse.branch(), lines)));
        }

        Ok(uri_results(cx, uris))
    }
}

/// Revision URIs for `D123` tokens.
#[derive(Debug, Default)]
pub struct BrowseRevisionUriQuery;

fn revision_symbol(token: &str) -> Option<ObjectSymbolRef> {
    if !token.starts_with(['D', 'd']) {
        return None;
    }
    ObjectSymbolRef::parse(ObjectKind::Revision, token).ok()
}

impl Applicability for BrowseRevisionUriQuery {
    fn name(&self) -> &'static str {
        "browse-revision-uris"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BrowseRef::URIS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.downcast_ref::<BrowseRef>().is_some_and(|browse| {
            browse.supports(BrowseType::Revision)
                && browse.token().and_then(revision_symbol).is_some()
        })
    }
}

impl Query for BrowseRevisionUriQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let symbols: Vec<(RefId, RefId)> = browse_refs(&cx, &refs)
                .into_iter()
                .filter_map(|(id, browse)| {
                    let symbol = browse.token().and_then(revision_symbol)?;
                    Some((id, cx.insert(symbol)))
                })
                .collect();
            if symbols.is_empty() {
                return Ok(ResultMap::new());
            }

            let targets = unique(symbols.iter().map(|(_, symbol)| *symbol));
            cx.request(&targets, ObjectSymbolRef::OBJECT).await?;

            let mut uris = Vec::new();
            for (id, symbol) in symbols {
                let Some(revision) = cx.value(symbol, ObjectSymbolRef::OBJECT)?.as_ref_id() else {
                    continue;
                };
                if let Some(Some(uri)) = cx.with_ref(revision, |r: &RevisionRef| r.uri().map(str::to_string)) {
                    uris.push((id, BrowseType::Revision, uri));
                }
            }

            Ok(uri_results(&cx, uris))
        })
    }
}

/// URIs for any object the server can look up by name, like `T12` or `@alice`.
#[derive(Debug, Default)]
pub struct BrowseObjectUriQuery;

impl Applicability for BrowseObjectUriQuery {
    fn name(&self) -> &'static str {
        "browse-object-uris"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[BrowseRef::URIS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.downcast_ref::<BrowseRef>().is_some_and(|browse| {
            browse.supports(BrowseType::Object) && browse.token().is_some_and(|token| token != ".")
        })
    }
}

impl Query for BrowseObjectUriQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let tokens: Vec<(RefId, String)> = browse_refs(&cx, &refs)
                .into_iter()
                .filter_map(|(id, browse)| Some((id, browse.token()?.to_string())))
                .collect();
            if tokens.is_empty() {
                return Ok(ResultMap::new());
            }

            let names = unique(tokens.iter().map(|(_, token)| token.clone()));
            let found = call(&cx, "phid.lookup", json!({ "names": names }))?.await?;

            let uris = tokens
                .into_iter()
                .filter_map(|(id, token)| {
                    let uri = found.get(&token)?.get("uri").and_then(Json::as_str)?;
                    Some((id, BrowseType::Object, uri.to_string()))
                })
                .collect();

            Ok(uri_results(&cx, uris))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::Config;
    use crate::engine::Engine;
    use crate::query::producers;
    use crate::refs::RepositoryRef;
    use crate::repository::Vcs;
    use crate::testing::{FakeConduit, FakeRepository, stdout};

    const HEAD: &str = "1111111111111111111111111111111111111111";

    fn engine(conduit: Arc<FakeConduit>) -> (Engine, Arc<FakeRepository>) {
        let repository = FakeRepository::new(Vcs::Git, |_, stdin| {
            let input = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
            let out: String = input
                .lines()
                .map(|symbol| match symbol {
                    "HEAD" | "main" => format!("{HEAD} commit 240\n"),
                    other => format!("{other} missing\n"),
                })
                .collect();
            stdout(&out)
        });
        let env = Environment::new(Config::default())
            .with_repository(repository.clone())
            .with_conduit(conduit)
            .with_remote(RepositoryRef::new("PHID-REPO-1", "https://example.com/source/app/"));

        let engine = Engine::builder(env).producers(producers()).build().unwrap();
        (engine, repository)
    }

    fn uris(engine: &Engine, id: RefId) -> Vec<String> {
        engine
            .hardpoint(id, BrowseRef::URIS)
            .unwrap()
            .ref_ids()
            .into_iter()
            .filter_map(|uri| engine.get::<BrowseUriRef>(uri))
            .map(|uri| format!("{}:{}", uri.kind(), uri.uri()))
            .collect()
    }

    fn conduit() -> Arc<FakeConduit> {
        let conduit = FakeConduit::new();
        conduit.respond("diffusion.querycommits", |_| {
            Ok(json!({
                "identifierMap": { HEAD: "PHID-CMIT-1" },
                "data": { "PHID-CMIT-1": { "uri": "https://example.com/rAPP1111" } },
            }))
        });
        conduit.respond("phid.lookup", |_| {
            Ok(json!({ "T12": { "uri": "https://example.com/T12" } }))
        });
        conduit.respond("differential.revision.search", |_| {
            Ok(json!({
                "data": [{
                    "id": 5,
                    "phid": "PHID-DREV-5",
                    "fields": { "title": "Five", "uri": "https://example.com/D5" },
                }],
                "cursor": { "after": null },
            }))
        });
        conduit
    }

    #[test]
    fn test_browse_tokens() {
        let (mut engine, _) = engine(conduit());

        let dot = engine.insert(BrowseRef::with_token("."));
        let file = engine.insert(BrowseRef::with_token("src/main.rs$12"));
        let branch = engine.insert(BrowseRef::with_token("main"));
        let task = engine.insert(BrowseRef::with_token("T12"));
        let revision = engine.insert(BrowseRef::with_token("D5"));
        let head = engine.insert(BrowseRef::new().with_types([BrowseType::Commit]));

        let all = [dot, file, branch, task, revision, head];
        engine.resolve(&all, &[BrowseRef::URIS]).unwrap();

        assert_eq!(
            uris(&engine, dot),
            vec!["path:https://example.com/source/app/browse/master/"]
        );
        assert_eq!(
            uris(&engine, file),
            vec!["path:https://example.com/source/app/browse/master/src/main.rs$12"]
        );
        assert_eq!(uris(&engine, branch), vec!["commit:https://example.com/rAPP1111"]);
        assert_eq!(uris(&engine, task), vec!["object:https://example.com/T12"]);
        assert_eq!(
            uris(&engine, revision),
            vec!["revision:https://example.com/D5"]
        );
        assert_eq!(uris(&engine, head), vec!["commit:https://example.com/rAPP1111"]);
    }

    #[test]
    fn test_no_head_commit_browses_nothing() {
        let repository = FakeRepository::new(Vcs::Git, |_, stdin| {
            let input = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
            let out: String = input.lines().map(|symbol| format!("{symbol} missing\n")).collect();
            stdout(&out)
        });
        let conduit = conduit();
        let env = Environment::new(Config::default())
            .with_repository(repository.clone())
            .with_conduit(conduit.clone())
            .with_remote(RepositoryRef::new("PHID-REPO-1", "https://example.com/source/app/"));
        let mut engine = Engine::builder(env).producers(producers()).build().unwrap();

        let head = engine.insert(BrowseRef::new().with_types([BrowseType::Commit]));
        engine.resolve(&[head], &[BrowseRef::COMMIT_REFS, BrowseRef::URIS]).unwrap();

        assert_eq!(
            engine.hardpoint(head, BrowseRef::COMMIT_REFS).unwrap(),
            Value::List(Vec::new())
        );
        assert!(uris(&engine, head).is_empty());
        assert_eq!(repository.calls().len(), 1);
        assert_eq!(conduit.calls("diffusion.querycommits"), 0);
    }

    #[test]
    fn test_dot_never_resolves_as_a_commit() {
        let (mut engine, repository) = engine(conduit());

        let dot = engine.insert(BrowseRef::with_token(".").with_types([BrowseType::Commit]));
        engine.resolve(&[dot], &[BrowseRef::COMMIT_REFS]).unwrap();

        assert_eq!(
            engine.hardpoint(dot, BrowseRef::COMMIT_REFS).unwrap(),
            Value::List(Vec::new())
        );
        assert!(repository.calls().is_empty());
    }
}
