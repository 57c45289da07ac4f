use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::{Value as Json, json};

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::producer::{Applicability, Query, ResultMap, TaskFuture};
use crate::query::{call, has_conduit, unique};
use crate::refs::{CommitRef, CommitSymbolRef, Ref, RevisionRef, WorkingCopyStateRef};
use crate::repository::Vcs;

/// The commit the working copy is on, through the VCS's head symbol.
#[derive(Debug, Default)]
pub struct WorkingCopyCommitQuery;

impl Applicability for WorkingCopyCommitQuery {
    fn name(&self) -> &'static str {
        "working-copy-commit"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[WorkingCopyStateRef::COMMIT]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        env.repository.is_some()
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<WorkingCopyStateRef>()
    }
}

impl Query for WorkingCopyCommitQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let vcs = cx.repository()?.vcs();
            let symbol = cx.insert(CommitSymbolRef::new(vcs.head_symbol())?);

            cx.request(&[symbol], CommitSymbolRef::OBJECT).await?;
            let commit = cx.value(symbol, CommitSymbolRef::OBJECT)?;

            Ok(QueryContext::value_map(&refs, commit))
        })
    }
}

/// Revisions whose diffs were built from the working copy commit, matched by
/// commit and tree hash.
#[derive(Debug, Default)]
pub struct WorkingCopyRevisionQuery;

impl Applicability for WorkingCopyRevisionQuery {
    fn name(&self) -> &'static str {
        "working-copy-revisions"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[WorkingCopyStateRef::REVISIONS]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        env.repository.is_some() && has_conduit(env)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<WorkingCopyStateRef>()
    }
}

impl Query for WorkingCopyRevisionQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let vcs = cx.repository()?.vcs();
            let commits = cx.hardpoints(&refs, WorkingCopyStateRef::COMMIT).await?;

            // (type, hash) -> refs whose commit has that hash.
            let mut owners: HashMap<(String, String), Vec<RefId>> = HashMap::new();
            for (&id, commit) in refs.iter().zip(&commits) {
                let Some(commit) = commit.as_ref_id().and_then(|c| cx.read::<CommitRef>(c)) else {
                    continue;
                };
                for pair in commit_hashes(vcs, &commit) {
                    owners.entry(pair).or_default().push(id);
                }
            }

            if owners.is_empty() {
                return Ok(ResultMap::new());
            }

            let hashes: Vec<Json> = unique(owners.keys().cloned())
                .into_iter()
                .map(|(kind, hash)| json!([kind, hash]))
                .collect();

            let result = call(
                &cx,
                "differential.query",
                json!({ "commitHashes": hashes }),
            )?
            .await?;

            let entries: Vec<&Json> = match &result {
                Json::Array(list) => list.iter().collect(),
                Json::Object(map) => map.values().collect(),
                _ => Vec::new(),
            };

            let mut found: BTreeMap<RefId, Vec<RefId>> = BTreeMap::new();
            for entry in entries {
                let Some(revision) = RevisionRef::from_query(entry) else {
                    continue;
                };
                let revision = cx.insert(revision);

                let pairs = entry.get("hashes").and_then(Json::as_array);
                for pair in pairs.into_iter().flatten() {
                    let (Some(kind), Some(hash)) = (
                        pair.get(0).and_then(Json::as_str),
                        pair.get(1).and_then(Json::as_str),
                    ) else {
                        continue;
                    };
                    let key = (kind.to_string(), hash.to_string());
                    for &owner in owners.get(&key).into_iter().flatten() {
                        let list = found.entry(owner).or_default();
                        if !list.contains(&revision) {
                            list.push(revision);
                        }
                    }
                }
            }

            Ok(found
                .into_iter()
                .map(|(id, revisions)| (id, Value::refs(revisions)))
                .collect())
        })
    }
}

/// Hash pairs a diff records for the commit it was created from.
fn commit_hashes(vcs: Vcs, commit: &CommitRef) -> Vec<(String, String)> {
    match vcs {
        Vcs::Git => {
            let mut pairs = vec![("gtcm".to_string(), commit.hash().to_string())];
            if let Some(tree) = commit.tree_hash() {
                pairs.push(("gttr".to_string(), tree.to_string()));
            }
            pairs
        }
        Vcs::Mercurial => vec![("hgcm".to_string(), commit.hash().to_string())],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::core::Config;
    use crate::engine::Engine;
    use crate::producer::Producer;
    use crate::query::{GitCommitSymbolQuery, MercurialCommitSymbolQuery};
    use crate::testing::{FakeConduit, FakeRepository, stdout};

    const HEAD: &str = "1111111111111111111111111111111111111111";
    const NULL_NODE: &str = "0000000000000000000000000000000000000000";

    /// A fresh repository where nothing is checked out yet.
    fn headless(vcs: Vcs, conduit: Arc<FakeConduit>) -> Engine {
        let repository = FakeRepository::new(vcs, move |_, stdin| match vcs {
            Vcs::Git => {
                let input = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
                let out: String = input.lines().map(|symbol| format!("{symbol} missing\n")).collect();
                stdout(&out)
            }
            // `hg log -r .` prints the null revision.
            Vcs::Mercurial => stdout(&format!("-1\u{1}{NULL_NODE}\u{1}CWD\u{1}\u{3}")),
        });
        let env = Environment::new(Config::default())
            .with_repository(repository)
            .with_conduit(conduit);

        Engine::builder(env)
            .producer(Producer::query(GitCommitSymbolQuery))
            .producer(Producer::query(MercurialCommitSymbolQuery))
            .producer(Producer::query(WorkingCopyCommitQuery))
            .producer(Producer::query(WorkingCopyRevisionQuery))
            .build()
            .unwrap()
    }

    fn engine(conduit: Arc<FakeConduit>) -> Engine {
        let repository = FakeRepository::new(Vcs::Git, |_, _| stdout(&format!("{HEAD} commit 240\n")));
        let env = Environment::new(Config::default())
            .with_repository(repository)
            .with_conduit(conduit);

        Engine::builder(env)
            .producer(Producer::query(GitCommitSymbolQuery))
            .producer(Producer::query(WorkingCopyCommitQuery))
            .producer(Producer::query(WorkingCopyRevisionQuery))
            .build()
            .unwrap()
    }

    #[test]
    fn test_commit_hashes_by_vcs() {
        let commit = CommitRef::new("abc").with_tree_hash("def");

        assert_eq!(
            commit_hashes(Vcs::Git, &commit),
            vec![
                ("gtcm".to_string(), "abc".to_string()),
                ("gttr".to_string(), "def".to_string())
            ]
        );
        assert_eq!(
            commit_hashes(Vcs::Mercurial, &commit),
            vec![("hgcm".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn test_working_copy_revisions() {
        let conduit = FakeConduit::new();
        conduit.respond("differential.query", |_| {
            Ok(json!({
                "12": {
                    "id": "12",
                    "phid": "PHID-DREV-12",
                    "title": "Fix the frobnicator",
                    "hashes": [["gtcm", HEAD]],
                },
                "13": {
                    "id": "13",
                    "phid": "PHID-DREV-13",
                    "title": "Unrelated",
                    "hashes": [["gtcm", "2222222222222222222222222222222222222222"]],
                },
            }))
        });

        let mut engine = engine(Arc::clone(&conduit));
        let state = engine.insert(WorkingCopyStateRef::new());
        engine.resolve(&[state], &[WorkingCopyStateRef::REVISIONS]).unwrap();

        let revisions = engine
            .hardpoint(state, WorkingCopyStateRef::REVISIONS)
            .unwrap()
            .ref_ids();
        assert_eq!(revisions.len(), 1);

        let revision: RevisionRef = engine.get(revisions[0]).unwrap();
        assert_eq!(revision.monogram(), "D12");

        let commit = engine
            .hardpoint(state, WorkingCopyStateRef::COMMIT)
            .unwrap()
            .as_ref_id()
            .unwrap();
        let commit: CommitRef = engine.get(commit).unwrap();
        assert_eq!(commit.hash(), HEAD);

        assert_eq!(
            conduit.params("differential.query"),
            vec![json!({ "commitHashes": [["gtcm", HEAD]] })]
        );
    }

    #[test]
    fn test_no_head_commit_is_absent() {
        for vcs in [Vcs::Git, Vcs::Mercurial] {
            let conduit = FakeConduit::new();
            let mut engine = headless(vcs, Arc::clone(&conduit));

            let head = engine.insert(CommitSymbolRef::new(vcs.head_symbol()).unwrap());
            let state = engine.insert(WorkingCopyStateRef::new());
            engine.resolve(&[head], &[CommitSymbolRef::OBJECT]).unwrap();
            engine
                .resolve(&[state], &[WorkingCopyStateRef::COMMIT, WorkingCopyStateRef::REVISIONS])
                .unwrap();

            assert_eq!(engine.hardpoint(head, CommitSymbolRef::OBJECT).unwrap(), Value::Absent, "{vcs:?}");
            assert_eq!(engine.hardpoint(state, WorkingCopyStateRef::COMMIT).unwrap(), Value::Absent, "{vcs:?}");
            assert_eq!(
                engine.hardpoint(state, WorkingCopyStateRef::REVISIONS).unwrap(),
                Value::List(Vec::new())
            );
            assert_eq!(conduit.total_calls(), 0);
        }
    }
}
