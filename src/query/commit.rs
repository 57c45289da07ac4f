use std::collections::HashMap;
use std::rc::Rc;

use anyhow::bail;

use crate::core::{Environment, RefId, Value};
use crate::engine::QueryContext;
use crate::producer::{Applicability, Query, ResultMap, TaskFuture};
use crate::query::{args, has_vcs, unique};
use crate::refs::{CommitRef, CommitSymbolRef, Ref};
use crate::repository::Vcs;

/// Symbols of the batch, keyed by ref.
fn symbols(cx: &QueryContext, refs: &[RefId]) -> Vec<(RefId, String)> {
    refs.iter()
        .filter_map(|&id| {
            cx.with_ref(id, |symbol: &CommitSymbolRef| (id, symbol.symbol().to_string()))
        })
        .collect()
}

/// Maps every symbol that resolved to a fresh commit ref.
fn commit_results(
    cx: &QueryContext,
    symbols: &[(RefId, String)],
    hashes: &HashMap<String, String>,
) -> ResultMap {
    symbols
        .iter()
        .filter_map(|(id, symbol)| {
            let hash = hashes.get(symbol)?;
            Some((*id, Value::Ref(cx.insert(CommitRef::new(hash.clone())))))
        })
        .collect()
}

/// Resolves commit symbols with one `git cat-file --batch-check`.
#[derive(Debug, Default)]
pub struct GitCommitSymbolQuery;

impl Applicability for GitCommitSymbolQuery {
    fn name(&self) -> &'static str {
        "git-commit-symbol"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[CommitSymbolRef::OBJECT]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_vcs(env, Vcs::Git)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<CommitSymbolRef>()
    }
}

impl Query for GitCommitSymbolQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let symbols = symbols(&cx, &refs);
            let set = unique(symbols.iter().map(|(_, symbol)| symbol.clone()));
            if set.is_empty() {
                return Ok(ResultMap::new());
            }

            let mut stdin = set.join("\n");
            stdin.push('\n');

            let api = cx.repository()?;
            let output = cx
                .future(api.execute(
                    args(["cat-file", "--batch-check", "--"]),
                    Some(stdin.into_bytes()),
                ))
                .await?;

            let lines: Vec<&str> = output.stdout.lines().collect();
            if lines.len() != set.len() {
                bail!(
                    "Execution of \"git cat-file --batch-check\" emitted an unexpected number of lines, expected {} but got {}.",
                    set.len(),
                    lines.len()
                );
            }

            let mut hashes = HashMap::new();
            for (symbol, line) in set.iter().zip(lines) {
                let mut parts = line.splitn(3, ' ');
                let (Some(hash), Some(kind)) = (parts.next(), parts.next()) else {
                    bail!(
                        "Execution of \"git cat-file --batch-check\" emitted an unexpected line ({line:?})."
                    );
                };
                // Tags pointing at commits are not followed.
                if kind == "commit" {
                    hashes.insert(symbol.clone(), hash.to_string());
                }
            }

            Ok(commit_results(&cx, &symbols, &hashes))
        })
    }
}

// Field separators of the log template.
const FIELD: char = '\u{1}';
const MARKER: char = '\u{2}';
const RECORD: char = '\u{3}';

const NULL_NODE: &str = "0000000000000000000000000000000000000000";

/// Resolves commit symbols with one `hg log` and a revset per symbol.
#[derive(Debug, Default)]
pub struct MercurialCommitSymbolQuery;

impl Applicability for MercurialCommitSymbolQuery {
    fn name(&self) -> &'static str {
        "hg-commit-symbol"
    }

    fn hardpoints(&self) -> &'static [&'static str] {
        &[CommitSymbolRef::OBJECT]
    }

    fn can_apply_env(&self, env: &Environment) -> bool {
        has_vcs(env, Vcs::Mercurial)
    }

    fn can_apply(&self, object: &dyn Ref) -> bool {
        object.is::<CommitSymbolRef>()
    }
}

impl Query for MercurialCommitSymbolQuery {
    fn load(
        self: Rc<Self>,
        cx: QueryContext,
        refs: Vec<RefId>,
        _hardpoint: &'static str,
    ) -> TaskFuture {
        Box::pin(async move {
            let symbols = symbols(&cx, &refs);
            let set = unique(symbols.iter().map(|(_, symbol)| symbol.clone()));
            if set.is_empty() {
                return Ok(ResultMap::new());
            }

            let api = cx.repository()?;
            let output = cx.future(api.execute(log_args(&set), None)).await?;
            let hashes = parse_log(&output.stdout, &set)?;

            Ok(commit_results(&cx, &symbols, &hashes))
        })
    }
}

/// `hg log` arguments resolving every symbol at once.
///
/// Any invalid `--rev` fails the whole command, so markers are matched with
/// `bookmark("re:...")` and `tag("re:...")`, which match nothing instead of
/// failing. Several symbols naming one node are printed once, so the template
/// prints the markers of each node to map them back.
fn log_args(symbols: &[String]) -> Vec<String> {
    let template = format!(
        "{{rev}}{FIELD}{{node}}{FIELD}{{ifcontains(rev, revset('parents()'), 'CWD', 'NOTCWD')}}{FIELD}{{tags % '{{tag}}{MARKER}'}}{{bookmarks % '{{bookmark}}{MARKER}'}}{RECORD}"
    );

    let mut args = vec!["log".to_string(), "--template".to_string(), template];

    for symbol in symbols {
        args.push("--rev".to_string());
        args.push(revset(symbol));
    }

    args
}

fn revset(symbol: &str) -> String {
    if symbol == "." {
        return ".".to_string();
    }

    let mut predicates = Vec::new();
    let is_digits = symbol.bytes().all(|b| b.is_ascii_digit());

    if symbol.bytes().all(|b| b.is_ascii_hexdigit()) && symbol.len() <= 40 {
        predicates.push(format!("id({})", quote(symbol)));
    }

    if is_digits {
        // Larger numbers make rev() raise.
        if symbol.parse::<u64>().is_ok_and(|rev| rev <= 2_147_483_647) {
            predicates.push(format!("rev({})", quote(symbol)));
        }
    } else {
        // Numbers are never valid marker names.
        let pattern = quote(&format!("re:^{}$", regex_escape(symbol)));
        predicates.push(format!("bookmark({pattern})"));
        predicates.push(format!("tag({pattern})"));
    }

    predicates.join(" or ")
}

/// Quotes a revset string literal.
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn regex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?[^]$(){}=!<>|:-#/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Symbol to node map from the `hg log` output. Symbols that match several
/// nodes are dropped.
fn parse_log(stdout: &str, symbols: &[String]) -> anyhow::Result<HashMap<String, String>> {
    // `None` marks a collision.
    let mut map: HashMap<String, Option<String>> = HashMap::new();
    let mut nodes = Vec::new();

    fn mark(map: &mut HashMap<String, Option<String>>, key: &str, node: &str) {
        match map.get(key) {
            None => {
                map.insert(key.to_string(), Some(node.to_string()));
            }
            Some(Some(existing)) if existing != node => {
                map.insert(key.to_string(), None);
            }
            Some(_) => {}
        }
    }

    for line in stdout.split(RECORD) {
        let parts: Vec<&str> = line.splitn(4, FIELD).collect();
        if parts.iter().all(|part| part.trim().is_empty()) {
            continue;
        }

        let (rev, node, cwd, markers) = match parts.as_slice() {
            [rev, node, cwd] => (*rev, *node, *cwd, Vec::new()),
            [rev, node, cwd, markers] => (
                *rev,
                *node,
                *cwd,
                markers.split(MARKER).filter(|m| !m.is_empty()).collect(),
            ),
            _ => bail!("Execution of \"hg log\" emitted an unexpected line ({line:?})."),
        };

        // The null revision of an empty repository is no commit.
        if node == NULL_NODE {
            continue;
        }

        nodes.push(node);

        if symbols.iter().any(|symbol| symbol == rev) {
            mark(&mut map, rev, node);
        }
        for marker in markers {
            mark(&mut map, marker, node);
        }
        if cwd == "CWD" {
            mark(&mut map, ".", node);
        }
    }

    // Markers win over hash prefixes, so prefixes only fill what is left.
    for node in &nodes {
        for symbol in symbols {
            if node.starts_with(symbol.as_str()) && !map.contains_key(symbol) {
                map.insert(symbol.clone(), Some(node.to_string()));
            }
        }
    }

    Ok(map
        .into_iter()
        .filter_map(|(symbol, node)| Some((symbol, node?)))
        .collect())
}
