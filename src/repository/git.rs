use camino::{Utf8Path, Utf8PathBuf};

use crate::future::{ExecFuture, ExecOutput, OpFuture};
use crate::repository::{RepositoryApi, Vcs};

pub const GIT_EXEC: &str = "git";

/// Runs `git` in a working copy.
#[derive(Debug, Clone)]
pub struct GitApi {
    root: Utf8PathBuf,
}

impl GitApi {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn command(&self, args: impl IntoIterator<Item = String>) -> ExecFuture {
        ExecFuture::new(GIT_EXEC)
            .args(args)
            .current_dir(self.root.clone())
            // Keep output stable regardless of user settings.
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
    }
}

impl RepositoryApi for GitApi {
    fn vcs(&self) -> Vcs {
        Vcs::Git
    }

    fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn execute(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> OpFuture<ExecOutput> {
        let mut future = self.command(args);
        if let Some(stdin) = stdin {
            future = future.write(stdin);
        }
        future.boxed()
    }
}
