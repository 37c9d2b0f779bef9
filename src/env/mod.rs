pub mod arch;

pub use arch::{device_abi, Arch};

use crate::config::Config;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Files whose presence marks a root filesystem as installed.
const INSTALLED_MARKERS: [&str; 3] = ["etc/os-release", "bin/sh", "usr/bin/sh"];

/// Shells probed inside the root, in order of preference.
const SHELL_CANDIDATES: [&str; 2] = ["bin/bash", "usr/bin/bash"];
const FALLBACK_SHELL: &str = "/bin/sh";

/// A provisioned (or to-be-provisioned) root filesystem under the environment root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    id: String,
    root: PathBuf,
}

impl Environment {
    pub fn new(config: &Config, id: &str) -> Result<Self> {
        validate_id(id)?;
        Ok(Self {
            id: id.to_string(),
            root: config.env_root().join(id),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory the sandbox uses for its own temporary files.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn is_installed(&self) -> bool {
        INSTALLED_MARKERS
            .iter()
            .any(|marker| present(&self.root.join(marker)))
    }

    /// Absolute path (inside the root) of the shell commands are run with.
    pub fn shell(&self) -> String {
        SHELL_CANDIDATES
            .iter()
            .find(|candidate| present(&self.root.join(candidate)))
            .map(|candidate| format!("/{candidate}"))
            .unwrap_or_else(|| FALLBACK_SHELL.to_string())
    }
}

/// Entries inside the root are probed without following links: an absolute
/// link target means a path inside the root, not on the host.
fn present(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidEnvironmentId { id: id.to_string() })
    }
}
