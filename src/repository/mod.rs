//! Working copy access.
//!
//! A [`RepositoryApi`] runs the version control binary of one working copy
//! and hands back operations; producers never touch the repository directly.

mod git;
mod hg;

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

pub use git::GitApi;
pub use hg::MercurialApi;

use crate::future::{ExecOutput, OpFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vcs {
    Git,
    Mercurial,
}

impl Vcs {
    pub fn name(self) -> &'static str {
        match self {
            Vcs::Git => "git",
            Vcs::Mercurial => "hg",
        }
    }

    /// Symbol naming the commit the working copy is based on.
    pub fn head_symbol(self) -> &'static str {
        match self {
            Vcs::Git => "HEAD",
            Vcs::Mercurial => ".",
        }
    }

    fn marker(self) -> &'static str {
        match self {
            Vcs::Git => ".git",
            Vcs::Mercurial => ".hg",
        }
    }
}

impl fmt::Display for Vcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Command runner for one working copy.
pub trait RepositoryApi: Send + Sync {
    fn vcs(&self) -> Vcs;

    /// Top level directory of the working copy.
    fn root(&self) -> &Utf8Path;

    /// Runs the version control binary with `args` in the working copy root,
    /// feeding `stdin` if given. A non-zero exit is an error.
    fn execute(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> OpFuture<ExecOutput>;

    /// Whether `path`, relative to the root, exists in the working copy.
    fn path_exists(&self, path: &str) -> bool {
        let path = Utf8Path::new(path);
        if path.is_absolute() {
            return path.exists();
        }
        self.root().join(path).exists()
    }
}

/// Walks up from `start` looking for a git or Mercurial working copy.
pub fn discover(start: impl AsRef<Utf8Path>) -> Option<Arc<dyn RepositoryApi>> {
    let (vcs, root) = find_root(start.as_ref())?;
    tracing::debug!(%vcs, %root, "found working copy");

    Some(match vcs {
        Vcs::Git => Arc::new(GitApi::new(root)),
        Vcs::Mercurial => Arc::new(MercurialApi::new(root)),
    })
}

fn find_root(start: &Utf8Path) -> Option<(Vcs, Utf8PathBuf)> {
    start.ancestors().find_map(|dir| {
        [Vcs::Git, Vcs::Mercurial]
            .into_iter()
            .find(|vcs| dir.join(vcs.marker()).exists())
            .map(|vcs| (vcs, dir.to_path_buf()))
    })
}
