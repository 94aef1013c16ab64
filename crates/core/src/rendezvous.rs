//! Shared rendezvous directory for CPU collective bootstrap.
//!
//! The directory must exist before the first child starts and outlive the
//! last one. Holding a [`RendezvousDir`] for the lifetime of the local process
//! set gives exactly that: it is created on construction and removed on drop.

use std::path::Path;

use tempfile::TempDir;

use crate::env::{gloo_env, EnvMap};
use crate::error::Result;

#[derive(Debug)]
pub struct RendezvousDir {
    dir: TempDir,
}

impl RendezvousDir {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("fleetrun-gloo-").tempdir()?;
        tracing::debug!(path = %dir.path().display(), "created rendezvous directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Variables that point children at this directory.
    pub fn env(&self) -> EnvMap {
        gloo_env(self.path())
    }

    /// Remove the directory now, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(path = %path.display(), "removed rendezvous directory");
        Ok(())
    }
}
