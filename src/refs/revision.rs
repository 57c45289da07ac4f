use std::any::Any;

use serde_json::Value as Json;

use crate::core::Hardpoint;
use crate::refs::Ref;

/// A code review revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRef {
    id: u64,
    phid: String,
    title: String,
    uri: Option<String>,
    status: Option<String>,
    diff_phid: Option<String>,
}

impl RevisionRef {
    /// Revisions this one depends on.
    pub const PARENT_REVISIONS: &'static str = "parentRevisions";
    /// The buildable created for the revision's active diff.
    pub const BUILDABLE: &'static str = "buildable";

    const HARDPOINTS: &'static [Hardpoint] = &[
        Hardpoint::list(Self::PARENT_REVISIONS),
        Hardpoint::single(Self::BUILDABLE),
    ];

    pub fn new(id: u64, phid: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            phid: phid.into(),
            title: title.into(),
            uri: None,
            status: None,
            diff_phid: None,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_diff_phid(mut self, diff_phid: impl Into<String>) -> Self {
        self.diff_phid = Some(diff_phid.into());
        self
    }

    /// From a `differential.revision.search` result entry.
    pub fn from_search(data: &Json) -> Option<Self> {
        let fields = data.get("fields")?;
        Some(Self {
            id: data.get("id")?.as_u64()?,
            phid: data.get("phid")?.as_str()?.to_string(),
            title: str_field(fields, "title").unwrap_or_default(),
            uri: str_field(fields, "uri"),
            status: fields
                .get("status")
                .and_then(|status| status.get("value"))
                .and_then(Json::as_str)
                .map(str::to_string),
            diff_phid: str_field(fields, "diffPHID"),
        })
    }

    /// From a `differential.query` result entry. That method reports ids as
    /// strings.
    pub fn from_query(data: &Json) -> Option<Self> {
        let id = match data.get("id")? {
            Json::String(id) => id.parse().ok()?,
            other => other.as_u64()?,
        };
        Some(Self {
            id,
            phid: data.get("phid")?.as_str()?.to_string(),
            title: str_field(data, "title").unwrap_or_default(),
            uri: str_field(data, "uri"),
            status: str_field(data, "statusName"),
            diff_phid: str_field(data, "activeDiffPHID"),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn monogram(&self) -> String {
        format!("D{}", self.id)
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn diff_phid(&self) -> Option<&str> {
        self.diff_phid.as_deref()
    }
}

impl Ref for RevisionRef {
    fn ref_type(&self) -> &'static str {
        "revision"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn identity(&self) -> Option<String> {
        Some(self.phid.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The state of the local working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingCopyStateRef {
    _private: (),
}

impl WorkingCopyStateRef {
    /// The commit the working copy is based on.
    pub const COMMIT: &'static str = "commitRef";
    /// Revisions whose diffs were created from that commit.
    pub const REVISIONS: &'static str = "revisionRefs";

    const HARDPOINTS: &'static [Hardpoint] = &[
        Hardpoint::single(Self::COMMIT),
        Hardpoint::list(Self::REVISIONS),
    ];

    pub fn new() -> Self {
        Self::default()
    }
}

impl Ref for WorkingCopyStateRef {
    fn ref_type(&self) -> &'static str {
        "working copy"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn str_field(data: &Json, key: &str) -> Option<String> {
    data.get(key).and_then(Json::as_str).map(str::to_string)
}
