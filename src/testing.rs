//! Fakes for the outside world, used by the tests of this crate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value as Json;

use crate::error::FutureError;
use crate::future::{Conduit, ExecOutput, OpFuture};
use crate::repository::{RepositoryApi, Vcs};

type ConduitHandler = Arc<dyn Fn(&Json) -> Result<Json, FutureError> + Send + Sync>;

/// A conduit client answering from scripted handlers, one per method.
#[derive(Default)]
pub(crate) struct FakeConduit {
    handlers: Mutex<HashMap<String, ConduitHandler>>,
    calls: Mutex<Vec<(String, Json)>>,
    delay: Option<Duration>,
}

impl FakeConduit {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call sleeps for `delay` before answering.
    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub(crate) fn respond<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Json) -> Result<Json, FutureError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Number of calls made to `method`.
    pub(crate) fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Parameters of every call made to `method`, in order.
    pub(crate) fn params(&self, method: &str) -> Vec<Json> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

impl Conduit for FakeConduit {
    fn call(&self, method: &str, params: Json) -> OpFuture<Json> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((method.to_string(), params.clone()));

        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned();

        let result = match handler {
            Some(handler) => handler(&params),
            None => Err(FutureError::Conduit {
                method: method.to_string(),
                code: "ERR-CONDUIT-CALL".to_string(),
                info: "method not found".to_string(),
            }),
        };

        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

type RepositoryHandler =
    Arc<dyn Fn(&[String], Option<&[u8]>) -> Result<ExecOutput, FutureError> + Send + Sync>;

/// A working copy whose commands are answered by a script.
pub(crate) struct FakeRepository {
    vcs: Vcs,
    root: Utf8PathBuf,
    handler: RepositoryHandler,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeRepository {
    pub(crate) fn new<F>(vcs: Vcs, handler: F) -> Arc<Self>
    where
        F: Fn(&[String], Option<&[u8]>) -> Result<ExecOutput, FutureError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            vcs,
            root: Utf8PathBuf::from("/nonexistent/working-copy"),
            handler: Arc::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Arguments of every command run so far.
    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RepositoryApi for FakeRepository {
    fn vcs(&self) -> Vcs {
        self.vcs
    }

    fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn execute(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> OpFuture<ExecOutput> {
        let result = (self.handler)(&args, stdin.as_deref());
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(args);
        Box::pin(async move { result })
    }

    fn path_exists(&self, path: &str) -> bool {
        path.starts_with("src/")
    }
}

/// Successful process output.
pub(crate) fn stdout(text: &str) -> Result<ExecOutput, FutureError> {
    Ok(ExecOutput {
        status: 0,
        stdout: text.to_string(),
        stderr: String::new(),
        timed_out: false,
    })
}

/// An operation that finishes with `value` after `wait`.
pub(crate) fn delay<T: Send + 'static>(
    wait: Duration,
    value: T,
) -> impl Future<Output = Result<T, FutureError>> + Send + 'static {
    async move {
        tokio::time::sleep(wait).await;
        Ok(value)
    }
}
