use camino::{Utf8Path, Utf8PathBuf};

use crate::future::{ExecFuture, ExecOutput, OpFuture};
use crate::repository::{RepositoryApi, Vcs};

pub const HG_EXEC: &str = "hg";

/// Runs `hg` in a working copy, with user configuration that changes output
/// disabled.
#[derive(Debug, Clone)]
pub struct MercurialApi {
    root: Utf8PathBuf,
}

impl MercurialApi {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn command(&self, args: impl IntoIterator<Item = String>) -> ExecFuture {
        ExecFuture::new(HG_EXEC)
            .args(args)
            .current_dir(self.root.clone())
            .env("HGPLAIN", "1")
            .env("LC_ALL", "C")
    }
}

impl RepositoryApi for MercurialApi {
    fn vcs(&self) -> Vcs {
        Vcs::Mercurial
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
