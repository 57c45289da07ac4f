use std::any::Any;
use std::fmt;

use crate::core::Hardpoint;
use crate::refs::Ref;

/// The ways a browse token may be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BrowseType {
    Commit,
    Path,
    Revision,
    Object,
}

impl BrowseType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(BrowseType::Commit),
            "path" => Some(BrowseType::Path),
            "revision" => Some(BrowseType::Revision),
            "object" => Some(BrowseType::Object),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BrowseType::Commit => "commit",
            BrowseType::Path => "path",
            BrowseType::Revision => "revision",
            BrowseType::Object => "object",
        }
    }
}

impl fmt::Display for BrowseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A user supplied browse target. The token may name a commit, a path in the
/// working copy, a revision or any object the server knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseRef {
    token: Option<String>,
    types: Vec<BrowseType>,
    branch: Option<String>,
}

impl BrowseRef {
    /// Commits the token resolves to.
    pub const COMMIT_REFS: &'static str = "commitRefs";
    /// Candidate URIs, one per interpretation that matched.
    pub const URIS: &'static str = "uris";

    const HARDPOINTS: &'static [Hardpoint] = &[
        Hardpoint::list(Self::COMMIT_REFS),
        Hardpoint::list(Self::URIS),
    ];

    /// Browse target without a token: the current directory, or the head
    /// commit when restricted to commits.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Restricts the interpretations that are tried. No types means all.
    pub fn with_types(mut self, types: impl IntoIterator<Item = BrowseType>) -> Self {
        self.types = types.into_iter().collect();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn types(&self) -> &[BrowseType] {
        &self.types
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn has_type(&self, kind: BrowseType) -> bool {
        self.types.contains(&kind)
    }

    /// Whether an interpretation of this kind should be attempted.
    pub fn supports(&self, kind: BrowseType) -> bool {
        self.types.is_empty() || self.has_type(kind)
    }
}

impl Ref for BrowseRef {
    fn ref_type(&self) -> &'static str {
        "browse target"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One candidate URI for a browse target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseUriRef {
    kind: BrowseType,
    uri: String,
}

impl BrowseUriRef {
    pub fn new(kind: BrowseType, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
        }
    }

    pub fn kind(&self) -> BrowseType {
        self.kind
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Ref for BrowseUriRef {
    fn ref_type(&self) -> &'static str {
        "browse uri"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        &[]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports() {
        let any = BrowseRef::with_token("README.md");
        let commits = BrowseRef::with_token("HEAD").with_types([BrowseType::Commit]);

        assert!(any.supports(BrowseType::Path));
        assert!(commits.supports(BrowseType::Commit));
        assert!(!commits.supports(BrowseType::Path));
        assert_eq!(BrowseType::parse("revision"), Some(BrowseType::Revision));
        assert_eq!(BrowseType::parse("nope"), None);
    }
}
