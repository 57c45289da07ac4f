use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::error::FutureError;
use crate::future::OpFuture;

/// Client for the remote RPC service.
///
/// Implementations own the transport; the engine only ever awaits the
/// returned futures.
pub trait Conduit: Send + Sync {
    /// Calls `method` with `params` and resolves to the method's `result`.
    /// Errors reported by the server map to [`FutureError::Conduit`].
    fn call(&self, method: &str, params: Json) -> OpFuture<Json>;
}

/// A `*.search` call that follows the result cursor until every page has
/// been fetched.
#[derive(Clone)]
pub struct ConduitSearch {
    conduit: Arc<dyn Conduit>,
    method: String,
    constraints: Json,
    attachments: Option<Json>,
}

impl ConduitSearch {
    pub fn new(conduit: Arc<dyn Conduit>, method: impl Into<String>, constraints: Json) -> Self {
        Self {
            conduit,
            method: method.into(),
            constraints,
            attachments: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Json) -> Self {
        self.attachments = Some(attachments);
        self
    }

    /// Fetches every page and returns the concatenated `data` entries.
    pub async fn execute(self) -> Result<Vec<Json>, FutureError> {
        let mut results = Vec::new();
        let mut after: Option<Json> = None;

        loop {
            let mut params = Map::new();
            params.insert("constraints".into(), self.constraints.clone());
            if let Some(attachments) = &self.attachments {
                params.insert("attachments".into(), attachments.clone());
            }
            if let Some(after) = after.take() {
                params.insert("after".into(), after);
            }

            let page = self.conduit.call(&self.method, Json::Object(params)).await?;

            match page.get("data") {
                Some(Json::Array(data)) => results.extend(data.iter().cloned()),
                _ => {
                    return Err(FutureError::Transport {
                        method: self.method.clone(),
                        message: format!("response has no \"data\" list: {page}"),
                    });
                }
            }

            match next_cursor(&page) {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        Ok(results)
    }

    pub fn boxed(self) -> OpFuture<Vec<Json>> {
        Box::pin(self.execute())
    }
}

/// The `after` cursor for a conduit result, as used by methods like
/// `edge.search` that page outside of `*.search` conventions.
pub(crate) fn next_cursor(page: &Json) -> Option<Json> {
    page.pointer("/cursor/after").filter(|after| !after.is_null()).cloned()
}

/// Parameters for a cursor-paged call.
pub(crate) fn with_cursor(mut params: Json, after: Option<Json>) -> Json {
    if let (Some(after), Some(map)) = (after, params.as_object_mut()) {
        map.insert("after".into(), after);
    }
    params
}
