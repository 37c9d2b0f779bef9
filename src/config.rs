use crate::error::RetryConfig;
use crate::sandbox::SandboxSource;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RELEASE_API_URL: &str = "https://api.github.com/repos/proot-me/proot/releases";

/// Runtime configuration. Every field has a default; `config.json` in the data
/// directory may override any subset of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub release_api_url: String,
    pub user_agent: String,
    /// Directory holding prebuilt `proot-x86_64` / `proot-arm64` binaries
    pub bundled_dir: Option<PathBuf>,
    /// Replaces the built-in mirror list when non-empty
    pub sandbox_sources: Vec<SandboxSource>,
    pub alpine_image_url: Option<String>,
    pub ubuntu_image_url: Option<String>,
    pub device_abi: Option<String>,
    pub min_binary_size: u64,
    pub connect_timeout_ms: u64,
    pub metadata_timeout_ms: u64,
    pub binary_timeout_ms: u64,
    pub image_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub progress_every_entries: u64,
    pub auto_update: bool,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".userland"),
            release_api_url: DEFAULT_RELEASE_API_URL.to_string(),
            user_agent: format!("userland/{}", env!("CARGO_PKG_VERSION")),
            bundled_dir: None,
            sandbox_sources: Vec::new(),
            alpine_image_url: None,
            ubuntu_image_url: None,
            device_abi: None,
            min_binary_size: 10_000,
            connect_timeout_ms: 20_000,
            metadata_timeout_ms: 15_000,
            binary_timeout_ms: 300_000,
            image_timeout_ms: 30 * 60 * 1000,
            command_timeout_ms: 300_000,
            progress_every_entries: 300,
            auto_update: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Configuration rooted at `data_dir` with every other field defaulted.
    /// A relative directory is anchored at the current working directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            data_dir: std::path::absolute(&data_dir).unwrap_or(data_dir),
            ..Self::default()
        }
    }

    /// Load the configuration for `data_dir` (or `$HOME/.userland`), applying
    /// `config.json` from that directory when present.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir,
            None => Self::default_data_dir()?,
        };
        // Sandboxed commands run from inside the data directory
        let data_dir = std::path::absolute(&data_dir)
            .with_context(|| format!("Cannot resolve data directory {}", data_dir.display()))?;

        let config_path = data_dir.join("config.json");
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Cannot read {}", config_path.display()))?;
            serde_json::from_str::<Config>(&content)
                .with_context(|| format!("Invalid configuration in {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    fn default_data_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".userland"))
    }

    pub fn env_root(&self) -> PathBuf {
        self.data_dir.join("linux_env")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.data_dir.join("bin")
    }

    /// Scratch location for a downloaded base image
    pub fn scratch_archive(&self, env_id: &str) -> PathBuf {
        self.data_dir.join(format!("rootfs_{env_id}.tar.gz"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn binary_timeout(&self) -> Duration {
        Duration::from_millis(self.binary_timeout_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
