//! End-to-end provisioning of a distribution root with a Python toolchain.

use crate::cancel::OpContext;
use crate::config::Config;
use crate::env::{Arch, Environment};
use crate::error::{Error, Result};
use crate::events::ProgressRange;
use crate::executor::{ExecutionRequest, Executor};
use crate::extract::{unpack_rootfs, UnpackOptions};
use crate::sandbox::Resolver;
use crate::toolkit::Toolkit;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

const DOWNLOAD_RANGE: ProgressRange = ProgressRange::new(0.10, 0.62);
const EXTRACT_RANGE: ProgressRange = ProgressRange::new(0.62, 0.74);
/// Rough entry count of a minimal root, used to scale extraction progress
const EXPECTED_ENTRIES: u64 = 10_000;

const RESOLV_CONF: &str = "nameserver 8.8.8.8\nnameserver 1.1.1.1\n";
const HOSTS: &str = "127.0.0.1 localhost\n::1 localhost\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Alpine,
    Ubuntu,
}

impl Distro {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Alpine => "alpine",
            Distro::Ubuntu => "ubuntu",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            Distro::Alpine => "Alpine",
            Distro::Ubuntu => "Ubuntu",
        }
    }

    /// Official minimal root filesystem archive for `arch`.
    pub fn default_image_url(&self, arch: Arch) -> String {
        match self {
            Distro::Alpine => {
                let a = arch.as_str();
                format!(
                    "https://dl-cdn.alpinelinux.org/alpine/v3.19/releases/{a}/alpine-minirootfs-3.19.1-{a}.tar.gz"
                )
            }
            Distro::Ubuntu => {
                let a = match arch {
                    Arch::X86_64 => "amd64",
                    Arch::Aarch64 => "arm64",
                };
                format!(
                    "https://cdimage.ubuntu.com/ubuntu-base/releases/22.04/release/ubuntu-base-22.04-base-{a}.tar.gz"
                )
            }
        }
    }

    /// Image URL after applying any override from the configuration.
    pub fn image_url(&self, config: &Config, arch: Arch) -> String {
        let configured = match self {
            Distro::Alpine => config.alpine_image_url.as_deref(),
            Distro::Ubuntu => config.ubuntu_image_url.as_deref(),
        };
        match configured {
            Some(url) => url.replace("{arch}", arch.as_str()),
            None => self.default_image_url(arch),
        }
    }

    /// Package installation run inside the fresh root, in order.
    pub fn install_steps(&self) -> [InstallStep; 3] {
        let (refresh, install) = match self {
            Distro::Alpine => (
                "apk update -q 2>&1",
                "apk add --no-cache -q python3 py3-pip gcc musl-dev linux-headers python3-dev 2>&1",
            ),
            Distro::Ubuntu => (
                "apt-get update -qq 2>&1",
                "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq python3 python3-pip python3-dev build-essential 2>&1",
            ),
        };
        [
            InstallStep {
                label: "Updating package index…",
                step: "refreshing the package index",
                progress: 0.75,
                command: refresh,
                fatal: true,
            },
            InstallStep {
                label: "Installing Python 3 + pip + build tools…",
                step: "installing the Python runtime",
                progress: 0.82,
                command: install,
                fatal: true,
            },
            InstallStep {
                label: "Upgrading pip…",
                step: "upgrading pip",
                progress: 0.93,
                command: "pip3 install --upgrade pip setuptools wheel --quiet 2>&1 || true",
                fatal: false,
            },
        ]
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distro {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alpine" => Ok(Distro::Alpine),
            "ubuntu" => Ok(Distro::Ubuntu),
            other => Err(Error::not_found(format!("distribution '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstallStep {
    pub label: &'static str,
    /// Phrase used in the failure message
    pub step: &'static str,
    pub progress: f64,
    pub command: &'static str,
    pub fatal: bool,
}

/// Removes the downloaded image on every exit path.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(err) = fs::remove_file(&self.0) {
                warn!(path = %self.0.display(), error = %err, "could not remove scratch archive");
            }
        }
    }
}

pub struct Provisioner<'a> {
    toolkit: &'a Toolkit,
}

impl<'a> Provisioner<'a> {
    pub fn new(toolkit: &'a Toolkit) -> Self {
        Self { toolkit }
    }

    /// Build a ready-to-use root for `distro` at the environment's location and
    /// return its path.
    ///
    /// Cancellation is honoured between every stage, inside downloads and
    /// extraction, and by killing a running package command. A cancelled run
    /// yields [`Error::Cancelled`] and leaves any partially unpacked root in
    /// place for the next attempt to overwrite.
    pub fn provision(&self, env: &Environment, distro: Distro, ctx: &OpContext) -> Result<PathBuf> {
        let config = &self.toolkit.config;
        info!(env = %env.id(), %distro, "provisioning environment");

        self.toolkit.progress("Preparing directories…", 0.02);
        fs::create_dir_all(config.data_dir())?;
        fs::create_dir_all(config.bin_dir())?;
        fs::create_dir_all(env.root())?;

        Resolver::new(self.toolkit).ensure(&ctx.cancel)?;
        ctx.check()?;

        let url = distro.image_url(config, self.toolkit.arch());
        let scratch = ScratchFile(config.scratch_archive(env.id()));
        self.toolkit
            .progress(format!("Downloading {} Linux…", distro.display_name()), DOWNLOAD_RANGE.from);
        self.toolkit
            .client
            .fetch_to_file_with_progress(&url, &scratch.0, DOWNLOAD_RANGE, &ctx.cancel, self.toolkit.sink.as_ref())
            .map_err(|err| stage_error("downloading the base image", err))?;
        ctx.check()?;

        self.toolkit.progress("Extracting rootfs…", EXTRACT_RANGE.from);
        let summary = self
            .unpack(&scratch.0, env.root(), ctx)
            .map_err(|err| stage_error("extracting the base image", err))?;
        drop(scratch);
        if summary.cancelled {
            return Err(Error::Cancelled);
        }
        info!(env = %env.id(), entries = summary.entries, "root filesystem unpacked");

        write_network_config(env.root())?;

        self.install_packages(env, distro, ctx)?;

        self.toolkit.progress("✅ Python environment ready!", 1.0);
        info!(env = %env.id(), "environment ready");
        Ok(env.root().to_path_buf())
    }

    fn unpack(&self, archive: &Path, dest: &Path, ctx: &OpContext) -> Result<crate::extract::UnpackSummary> {
        let reader = GzDecoder::new(BufReader::new(File::open(archive)?));
        let options = UnpackOptions {
            progress_every: self.toolkit.config.progress_every_entries,
            range: EXTRACT_RANGE,
            expected_entries: EXPECTED_ENTRIES,
        };
        unpack_rootfs(reader, dest, &options, &ctx.cancel, self.toolkit.sink.as_ref())
    }

    fn install_packages(&self, env: &Environment, distro: Distro, ctx: &OpContext) -> Result<()> {
        let executor = Executor::new(self.toolkit);
        for step in distro.install_steps() {
            ctx.check()?;
            self.toolkit.progress(step.label, step.progress);

            let request = ExecutionRequest::new(env.id(), step.command)
                .with_timeout(self.toolkit.config.command_timeout());
            let result = executor.run(&request, ctx);
            ctx.check()?;

            if result.success() {
                continue;
            }
            let output = if result.stderr.trim().is_empty() {
                &result.stdout
            } else {
                &result.stderr
            };
            let reason = format!("exit code {}: {}", result.exit_code, tail(output, 5));
            if step.fatal {
                return Err(Error::setup(step.step, reason));
            }
            warn!(env = %env.id(), step = step.step, %reason, "optional setup step failed");
        }
        Ok(())
    }
}

fn write_network_config(root: &Path) -> Result<()> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc)?;
    // Distribution images may ship these as symlinks into paths that do not exist here
    for (name, content) in [("resolv.conf", RESOLV_CONF), ("hosts", HOSTS)] {
        let path = etc.join(name);
        if path.symlink_metadata().is_ok() {
            fs::remove_file(&path)?;
        }
        fs::write(&path, content)?;
    }
    Ok(())
}

fn stage_error(step: &str, err: Error) -> Error {
    match err {
        Error::Cancelled => Error::Cancelled,
        other => Error::setup(step, other),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}
