use std::any::Any;

use serde_json::Value as Json;

use crate::core::Hardpoint;
use crate::refs::Ref;

/// Something builds run against, usually a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildableRef {
    id: u64,
    phid: String,
    object_phid: Option<String>,
    status: Option<String>,
}

impl BuildableRef {
    pub const BUILDS: &'static str = "builds";
    /// Aggregate status computed from the builds: `passed`, `failed` or
    /// `building`.
    pub const STATUS: &'static str = "status";

    const HARDPOINTS: &'static [Hardpoint] = &[
        Hardpoint::list(Self::BUILDS),
        Hardpoint::single(Self::STATUS),
    ];

    pub fn new(id: u64, phid: impl Into<String>) -> Self {
        Self {
            id,
            phid: phid.into(),
            object_phid: None,
            status: None,
        }
    }

    /// From a `harbormaster.buildable.search` result entry.
    pub fn from_conduit(data: &Json) -> Option<Self> {
        let fields = data.get("fields");
        Some(Self {
            id: data.get("id")?.as_u64()?,
            phid: data.get("phid")?.as_str()?.to_string(),
            object_phid: fields
                .and_then(|f| f.get("objectPHID"))
                .and_then(Json::as_str)
                .map(str::to_string),
            status: fields
                .and_then(|f| f.get("buildableStatus"))
                .and_then(|s| s.get("value"))
                .and_then(Json::as_str)
                .map(str::to_string),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    pub fn object_phid(&self) -> Option<&str> {
        self.object_phid.as_deref()
    }

    /// Status as reported by the server, which may lag behind the builds.
    pub fn reported_status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

impl Ref for BuildableRef {
    fn ref_type(&self) -> &'static str {
        "buildable"
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

/// One build of a buildable.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRef {
    id: u64,
    phid: String,
    parameters: Json,
}

impl BuildRef {
    pub const BUILD_PLAN: &'static str = "buildPlan";

    const HARDPOINTS: &'static [Hardpoint] = &[Hardpoint::single(Self::BUILD_PLAN)];

    /// From a `harbormaster.build.search` result entry.
    pub fn from_conduit(data: &Json) -> Option<Self> {
        Some(Self {
            id: data.get("id")?.as_u64()?,
            phid: data.get("phid")?.as_str()?.to_string(),
            parameters: data.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    pub fn name(&self) -> Option<&str> {
        self.field(&["name"])
    }

    pub fn buildable_phid(&self) -> Option<&str> {
        self.field(&["buildablePHID"])
    }

    pub fn plan_phid(&self) -> Option<&str> {
        self.field(&["buildPlanPHID"])
    }

    pub fn status(&self) -> Option<&str> {
        self.field(&["buildStatus", "value"])
    }

    pub fn status_name(&self) -> Option<&str> {
        self.field(&["buildStatus", "name"])
    }

    /// ANSI color name for the status, as chosen by the server.
    pub fn status_ansi_color(&self) -> Option<&str> {
        self.field(&["buildStatus", "color.ansi"])
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.status(),
            Some("passed" | "failed" | "aborted" | "error" | "deadlocked")
        )
    }

    pub fn is_passed(&self) -> bool {
        self.status() == Some("passed")
    }

    /// Sorts passed builds first, then by status.
    pub fn status_sort_key(&self) -> (u8, String) {
        let class = if self.is_passed() { 1 } else { 2 };
        (class, self.status().unwrap_or_default().to_string())
    }

    fn field(&self, path: &[&str]) -> Option<&str> {
        path.iter()
            .try_fold(self.parameters.get("fields")?, |value, key| value.get(key))?
            .as_str()
    }
}

impl Ref for BuildRef {
    fn ref_type(&self) -> &'static str {
        "build"
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

/// The plan a build was started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlanRef {
    id: u64,
    phid: String,
    name: String,
}

impl BuildPlanRef {
    /// From a `harbormaster.buildplan.search` result entry.
    pub fn from_conduit(data: &Json) -> Option<Self> {
        Some(Self {
            id: data.get("id")?.as_u64()?,
            phid: data.get("phid")?.as_str()?.to_string(),
            name: data
                .get("fields")
                .and_then(|f| f.get("name"))
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Ref for BuildPlanRef {
    fn ref_type(&self) -> &'static str {
        "build plan"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        &[]
    }

    fn identity(&self) -> Option<String> {
        Some(self.phid.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
