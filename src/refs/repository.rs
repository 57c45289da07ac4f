use serde_json::Value as Json;

/// The remote repository a working copy is tracked as.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRef {
    phid: String,
    browse_uri: String,
    parameters: Json,
}

impl RepositoryRef {
    pub fn new(phid: impl Into<String>, browse_uri: impl Into<String>) -> Self {
        Self {
            phid: phid.into(),
            browse_uri: browse_uri.into(),
            parameters: Json::Null,
        }
    }

    /// From a `diffusion.repository.search` result entry.
    pub fn from_conduit(data: &Json, browse_uri: impl Into<String>) -> Option<Self> {
        Some(Self {
            phid: data.get("phid")?.as_str()?.to_string(),
            browse_uri: browse_uri.into(),
            parameters: data.clone(),
        })
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    pub fn name(&self) -> Option<&str> {
        self.parameters
            .get("fields")
            .and_then(|f| f.get("name"))
            .and_then(Json::as_str)
    }

    pub fn default_branch(&self) -> &str {
        self.parameters
            .get("fields")
            .and_then(|f| f.get("defaultBranch"))
            .and_then(Json::as_str)
            .unwrap_or("master")
    }

    /// Effective clone URIs, when the search asked for the `uris` attachment.
    pub fn uris(&self) -> Vec<&str> {
        self.parameters
            .pointer("/attachments/uris/uris")
            .and_then(Json::as_array)
            .map(|uris| {
                uris.iter()
                    .filter_map(|uri| uri.pointer("/fields/uri/effective"))
                    .filter_map(Json::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// URI of a path in the repository browser.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use hardpoint::refs::RepositoryRef;
    /// let repo = RepositoryRef::new("PHID-REPO-1", "https://example.com/source/app/");
    /// assert_eq!(
    ///     repo.browse_uri(Some("src/main file.rs"), None, Some("12-14")),
    ///     "https://example.com/source/app/browse/master/src/main%20file.rs$12-14",
    /// );
    /// ```
    pub fn browse_uri(&self, path: Option<&str>, branch: Option<&str>, lines: Option<&str>) -> String {
        let base = self.browse_uri.trim_end_matches('/');
        let branch = branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.default_branch());
        let path = path.unwrap_or("/").trim_start_matches('/');

        let mut uri = format!(
            "{base}/browse/{}/{}",
            escape(branch, false),
            escape(path, true)
        );

        if let Some(lines) = lines.filter(|l| !l.is_empty()) {
            uri.push('$');
            uri.push_str(&escape(lines, false));
        }

        uri
    }
}

/// Percent-encodes everything outside the unreserved set, optionally keeping
/// path separators.
fn escape(text: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
