use std::any::Any;

use crate::core::Hardpoint;
use crate::error::UsageError;
use crate::refs::Ref;

/// A user supplied name for a commit: a hash prefix, a branch, a tag, `HEAD`,
/// `.` and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSymbolRef {
    symbol: String,
}

impl CommitSymbolRef {
    /// Resolves to a [`CommitRef`], or to nothing when the symbol names no
    /// commit.
    pub const OBJECT: &'static str = "object";

    const HARDPOINTS: &'static [Hardpoint] = &[Hardpoint::single(Self::OBJECT)];

    pub fn new(symbol: impl Into<String>) -> Result<Self, UsageError> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(UsageError::EmptySymbol);
        }
        if symbol.contains('\n') {
            return Err(UsageError::NewlineInSymbol(symbol));
        }
        Ok(Self { symbol })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Ref for CommitSymbolRef {
    fn ref_type(&self) -> &'static str {
        "commit symbol"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn identity(&self) -> Option<String> {
        Some(self.symbol.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A concrete commit in the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    hash: String,
    tree_hash: Option<String>,
    summary: Option<String>,
}

impl CommitRef {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            tree_hash: None,
            summary: None,
        }
    }

    pub fn with_tree_hash(mut self, tree_hash: impl Into<String>) -> Self {
        self.tree_hash = Some(tree_hash.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn tree_hash(&self) -> Option<&str> {
        self.tree_hash.as_deref()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }
}

impl Ref for CommitRef {
    fn ref_type(&self) -> &'static str {
        "commit"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        &[]
    }

    fn identity(&self) -> Option<String> {
        Some(self.hash.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
