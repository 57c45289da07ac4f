use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::future::Conduit;
use crate::refs::RepositoryRef;
use crate::repository::RepositoryApi;

/// 32 bytes length generic hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hash of several parts, each one length-prefixed so that `("ab", "c")`
    /// and `("a", "bc")` never collide.
    pub(crate) fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Handle to a ref stored in the engine's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub(crate) u32);

impl RefId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Shape of the value a hardpoint holds once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// One value, or [`Value::Absent`].
    Single,
    /// A list. When several producers can fill the hardpoint for the same ref,
    /// each of them runs and their lists are concatenated.
    List,
    /// A map keyed by string.
    Map,
}

/// A named attribute slot declared by a ref type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardpoint {
    pub key: &'static str,
    pub cardinality: Cardinality,
}

impl Hardpoint {
    pub const fn single(key: &'static str) -> Self {
        Self {
            key,
            cardinality: Cardinality::Single,
        }
    }

    pub const fn list(key: &'static str) -> Self {
        Self {
            key,
            cardinality: Cardinality::List,
        }
    }

    pub const fn map(key: &'static str) -> Self {
        Self {
            key,
            cardinality: Cardinality::Map,
        }
    }
}

/// Resolved contents of a hardpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The hardpoint resolved to nothing. This is a normal outcome, for
    /// example for a symbol that names no commit.
    #[default]
    Absent,
    Ref(RefId),
    Text(String),
    Json(serde_json::Value),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The value a hardpoint of this cardinality holds when no producer
    /// supplied anything for it.
    pub fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::Single => Value::Absent,
            Cardinality::List => Value::List(Vec::new()),
            Cardinality::Map => Value::Map(BTreeMap::new()),
        }
    }

    pub fn refs(ids: impl IntoIterator<Item = RefId>) -> Self {
        Value::List(ids.into_iter().map(Value::Ref).collect())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn as_ref_id(&self) -> Option<RefId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_list(&self) -> &[Value] {
        match self {
            Value::List(list) => list,
            _ => &[],
        }
    }

    /// Every ref held directly by this value or by a list it holds.
    pub fn ref_ids(&self) -> Vec<RefId> {
        match self {
            Value::Ref(id) => vec![*id],
            Value::List(list) => list.iter().filter_map(Value::as_ref_id).collect(),
            _ => Vec::new(),
        }
    }

    /// Folds a partial result from one producer into the value accumulated so
    /// far for a slot.
    pub(crate) fn merge(&mut self, cardinality: Cardinality, incoming: Value) {
        match (cardinality, self, incoming) {
            (_, _, Value::Absent) => {}
            (Cardinality::List, Value::List(acc), Value::List(more)) => acc.extend(more),
            (Cardinality::List, Value::List(acc), item) => acc.push(item),
            (Cardinality::Map, Value::Map(acc), Value::Map(more)) => {
                for (key, value) in more {
                    acc.entry(key).or_insert(value);
                }
            }
            (_, slot @ Value::Absent, value) => *slot = value,
            // The first producer to supply a single value wins.
            _ => {}
        }
    }
}

/// Tunables for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on how long the scheduler waits on the operation pool
    /// before it checks the tasks again, in milliseconds.
    pub poll_interval_ms: u64,
    /// How many operations may run at the same time. The rest wait in a queue.
    pub future_limit: usize,
    /// Consecutive scheduling rounds without any progress after which
    /// resolution fails instead of hanging.
    pub stall_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            future_limit: 32,
            stall_rounds: 3,
        }
    }
}

impl Config {
    /// Reads a config from JSON, missing fields take their defaults.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use hardpoint::Config;
    /// let config = Config::from_json(r#"{ "future_limit": 4 }"#).unwrap();
    /// assert_eq!(config.future_limit, 4);
    /// assert_eq!(config.poll_interval_ms, 50);
    /// ```
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Everything producers may need from the outside world.
///
/// Producers check this once when the engine is built (see
/// [`crate::producer::Applicability::can_apply_env`]), so a producer that
/// needs a git working copy simply drops out of the registry when there is
/// none.
#[derive(Clone, Default)]
pub struct Environment {
    pub config: Config,
    /// Command runner for the working copy, if there is one.
    pub repository: Option<Arc<dyn RepositoryApi>>,
    /// Remote RPC client, if one is configured.
    pub conduit: Option<Arc<dyn Conduit>>,
    /// The remote repository the working copy is tracked as.
    pub remote: Option<RepositoryRef>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("repository", &self.repository.as_ref().map(|api| api.vcs()))
            .field("conduit", &self.conduit.is_some())
            .field("remote", &self.remote)
            .finish()
    }
}

impl Environment {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_repository(mut self, api: Arc<dyn RepositoryApi>) -> Self {
        self.repository = Some(api);
        self
    }

    pub fn with_conduit(mut self, conduit: Arc<dyn Conduit>) -> Self {
        self.conduit = Some(conduit);
        self
    }

    pub fn with_remote(mut self, remote: RepositoryRef) -> Self {
        self.remote = Some(remote);
        self
    }
}
