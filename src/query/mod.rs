//! The built-in producers.
//!
//! [`producers`] returns the registry in priority order: for hardpoints that
//! hold a single value the first applicable producer wins.

mod browse;
mod build;
mod commit;
mod revision;
mod symbol;
mod working_copy;

use std::collections::HashSet;

use serde_json::Value as Json;

pub use browse::{
    BrowseCommitQuery, BrowseCommitUriQuery, BrowseObjectUriQuery, BrowsePathUriLoader,
    BrowseRevisionUriQuery,
};
pub use build::{BuildPlanQuery, BuildableBuildsQuery, BuildableStatusLoader};
pub use commit::{GitCommitSymbolQuery, MercurialCommitSymbolQuery};
pub use revision::{RevisionBuildableQuery, RevisionParentsQuery};
pub use symbol::{SimpleSymbolQuery, UserSymbolQuery};
pub use working_copy::{WorkingCopyCommitQuery, WorkingCopyRevisionQuery};

use crate::core::Environment;
use crate::engine::{FutureHandle, QueryContext};
use crate::future::ConduitSearch;
use crate::producer::Producer;
use crate::repository::Vcs;

/// Every producer this crate ships.
pub fn producers() -> Vec<Producer> {
    vec![
        Producer::query(GitCommitSymbolQuery),
        Producer::query(MercurialCommitSymbolQuery),
        Producer::query(WorkingCopyCommitQuery),
        Producer::query(WorkingCopyRevisionQuery),
        Producer::query(SimpleSymbolQuery),
        Producer::query(UserSymbolQuery),
        Producer::query(RevisionParentsQuery),
        Producer::query(RevisionBuildableQuery),
        Producer::query(BuildableBuildsQuery),
        Producer::query(BuildPlanQuery),
        Producer::loader(BuildableStatusLoader),
        Producer::query(BrowseCommitQuery),
        Producer::query(BrowseCommitUriQuery),
        Producer::loader(BrowsePathUriLoader),
        Producer::query(BrowseRevisionUriQuery),
        Producer::query(BrowseObjectUriQuery),
    ]
}

fn has_vcs(env: &Environment, vcs: Vcs) -> bool {
    env.repository.as_ref().is_some_and(|api| api.vcs() == vcs)
}

fn has_conduit(env: &Environment) -> bool {
    env.conduit.is_some()
}

/// Submits a paged `*.search` call.
fn search(cx: &QueryContext, method: &str, constraints: Json) -> anyhow::Result<FutureHandle<Vec<Json>>> {
    Ok(cx.future(ConduitSearch::new(cx.conduit()?, method, constraints).boxed()))
}

/// Submits a plain conduit call.
fn call(cx: &QueryContext, method: &str, params: Json) -> anyhow::Result<FutureHandle<Json>> {
    Ok(cx.future(cx.conduit()?.call(method, params)))
}

/// Distinct items, in first-seen order.
fn unique<T, I>(items: I) -> Vec<T>
where
    I: IntoIterator<Item = T>,
    T: Eq + std::hash::Hash + Clone,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn args<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}
