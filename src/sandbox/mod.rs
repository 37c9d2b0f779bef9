use crate::config::Config;
use crate::env::Arch;
use crate::error::Result;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tracing::info;

pub mod release;
pub mod resolver;
pub mod update;

pub use resolver::{Origin, Resolution, Resolver};
pub use update::{check_for_update, spawn_background_update, UpdateReport};

/// Marker written for a binary copied from the bundled directory. A binary
/// carrying it is never replaced automatically.
pub const BUNDLED_VERSION: &str = "bundled";
pub const UNKNOWN_VERSION: &str = "unknown";
/// Version recorded for mirror downloads whose URL carries no version token
pub const PINNED_VERSION: &str = "5.3.0";

/// Names the binary may be stored under inside archives
pub const BINARY_CANDIDATES: [&str; 3] = ["proot", "usr/bin/proot", "bin/proot"];

/// Chunk size for streaming hashing (64 KB)
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFormat {
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "deb")]
    Deb,
}

/// A place the sandbox binary can be downloaded from. `{arch}` in the URL is
/// replaced by the target architecture token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSource {
    pub url: String,
    pub format: SourceFormat,
}

impl SandboxSource {
    pub fn new(url: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            url: url.into(),
            format,
        }
    }

    pub fn for_arch(&self, arch: Arch) -> Self {
        Self {
            url: self.url.replace("{arch}", arch.as_str()),
            format: self.format,
        }
    }

    /// Known mirrors in order of preference. v5.3.0 is the last proot-me
    /// release that shipped prebuilt binaries.
    pub fn defaults(arch: Arch) -> Vec<SandboxSource> {
        let a = arch.as_str();
        vec![
            Self::new(
                format!("https://github.com/proot-me/proot/releases/download/v5.3.0/proot-{a}"),
                SourceFormat::Binary,
            ),
            Self::new(
                format!("https://github.com/proot-me/proot/releases/download/v5.1.107-android/proot-{a}"),
                SourceFormat::Binary,
            ),
            Self::new(
                format!("https://raw.githubusercontent.com/AndronixApp/AndronixOrigin/master/repo/{a}/proot"),
                SourceFormat::Binary,
            ),
            Self::new(
                format!("https://packages.termux.dev/apt/termux-main/pool/stable/main/p/proot/proot_5.3.0-1_{a}.deb"),
                SourceFormat::Deb,
            ),
            Self::new(
                format!("https://github.com/CypherpunkArmory/UserLAnd-Assets-Support/raw/main/fs-assets/{a}/proot"),
                SourceFormat::Binary,
            ),
        ]
    }

    /// The configured source list, or the defaults when none is configured.
    pub fn resolve_list(config: &Config, arch: Arch) -> Vec<SandboxSource> {
        if config.sandbox_sources.is_empty() {
            Self::defaults(arch)
        } else {
            config
                .sandbox_sources
                .iter()
                .map(|source| source.for_arch(arch))
                .collect()
        }
    }
}

/// Extract `5.3.0` from `.../download/v5.3.0/...`.
pub fn version_from_url(url: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"download/v([\d.]+)/").ok())
        .as_ref()?
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|v| !v.is_empty())
}

/// The sandbox executable on disk and its version marker sidecar.
///
/// Readers go straight to the filesystem. Writers (acquisition and update)
/// hold `write_lock` and always stage into a temporary file in the same
/// directory, then rename over the binary.
#[derive(Debug)]
pub struct SandboxBinary {
    path: PathBuf,
    marker: PathBuf,
    write_lock: Mutex<()>,
}

impl SandboxBinary {
    pub fn new(bin_dir: &Path) -> Self {
        Self {
            path: bin_dir.join("proot"),
            marker: bin_dir.join("proot.version"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.bin_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn size(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// Crude validity check: present and larger than `min_size` bytes.
    pub fn is_valid(&self, min_size: u64) -> bool {
        self.size().is_some_and(|len| len > min_size)
    }

    pub fn version(&self) -> Option<String> {
        fs::read_to_string(&self.marker)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn is_protected(&self) -> bool {
        self.version().as_deref() == Some(BUNDLED_VERSION)
    }

    /// A temporary file next to the binary, removed on drop unless installed.
    pub fn staging_file(&self, prefix: &str) -> Result<NamedTempFile> {
        fs::create_dir_all(self.dir())?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".tmp")
            .tempfile_in(self.dir())?)
    }

    /// Mark `staged` executable, move it over the binary and record `version`.
    pub fn install(&self, staged: NamedTempFile, version: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.install_locked(staged, version)
    }

    /// Like [`install`](Self::install), but leaves a bundled binary in place.
    /// The marker is read under the write lock, so a bundled install racing
    /// with an update always wins. Returns whether `staged` was installed.
    pub fn install_unless_protected(&self, staged: NamedTempFile, version: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.is_protected() {
            return Ok(false);
        }
        self.install_locked(staged, version)?;
        Ok(true)
    }

    fn install_locked(&self, staged: NamedTempFile, version: &str) -> Result<()> {
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))?;
        staged.persist(&self.path).map_err(|err| err.error)?;

        let mut marker = tempfile::Builder::new()
            .prefix("proot.version")
            .tempfile_in(self.dir())?;
        marker.write_all(version.as_bytes())?;
        marker.persist(&self.marker).map_err(|err| err.error)?;

        info!(path = %self.path.display(), version, "sandbox binary installed");
        Ok(())
    }

    pub fn install_bytes(&self, data: &[u8], version: &str) -> Result<()> {
        let mut staged = self.staging_file("proot-extracted")?;
        staged.write_all(data)?;
        staged.flush()?;
        self.install(staged, version)
    }

    /// SHA-256 of the installed binary, read in 64 KB chunks.
    pub fn sha256(&self) -> Result<String> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_url() {
        assert_eq!(
            version_from_url("https://github.com/proot-me/proot/releases/download/v5.3.0/proot-v5.3.0-aarch64-static"),
            Some("5.3.0".to_string())
        );
        assert_eq!(
            version_from_url("https://github.com/proot-me/proot/releases/download/v5.1.107-android/proot-x86_64"),
            None
        );
        assert_eq!(version_from_url("https://example.org/proot"), None);
    }

    #[test]
    fn test_source_formats_deserialize() {
        let sources: Vec<SandboxSource> = serde_json::from_str(
            r#"[
                {"url": "a", "format": "binary"},
                {"url": "b", "format": "tar.gz"},
                {"url": "c", "format": "tgz"},
                {"url": "d", "format": "zip"},
                {"url": "e", "format": "deb"}
            ]"#,
        )
        .unwrap();
        let formats: Vec<_> = sources.iter().map(|s| s.format).collect();
        assert_eq!(
            formats,
            vec![
                SourceFormat::Binary,
                SourceFormat::TarGz,
                SourceFormat::TarGz,
                SourceFormat::Zip,
                SourceFormat::Deb
            ]
        );
    }

    #[test]
    fn test_configured_sources_expand_arch() {
        let mut config = Config::with_data_dir("/data");
        assert_eq!(SandboxSource::resolve_list(&config, Arch::X86_64).len(), 5);

        config.sandbox_sources = vec![SandboxSource::new("https://m.example/{arch}/proot", SourceFormat::Binary)];
        let list = SandboxSource::resolve_list(&config, Arch::Aarch64);
        assert_eq!(list, vec![SandboxSource::new("https://m.example/aarch64/proot", SourceFormat::Binary)]);
    }

    #[test]
    fn test_install_replaces_binary_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let binary = SandboxBinary::new(dir.path());
        assert!(!binary.exists());
        assert_eq!(binary.version(), None);

        binary.install_bytes(b"first build", "5.1.0").unwrap();
        binary.install_bytes(b"second build", BUNDLED_VERSION).unwrap();

        assert_eq!(fs::read(binary.path()).unwrap(), b"second build");
        assert_eq!(binary.version().as_deref(), Some(BUNDLED_VERSION));
        assert!(binary.is_protected());
        let mode = fs::metadata(binary.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(binary.is_valid(4));
        assert!(!binary.is_valid(100));

        // Only the binary and its marker remain
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["proot", "proot.version"]);
    }

    #[test]
    fn test_conditional_install_keeps_bundled_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = SandboxBinary::new(dir.path());

        let mut staged = binary.staging_file("proot_update").unwrap();
        staged.write_all(b"release build").unwrap();
        assert!(binary.install_unless_protected(staged, "5.3.0").unwrap());
        assert_eq!(binary.version().as_deref(), Some("5.3.0"));

        binary.install_bytes(b"bundled build", BUNDLED_VERSION).unwrap();
        let mut staged = binary.staging_file("proot_update").unwrap();
        staged.write_all(b"newer release").unwrap();
        assert!(!binary.install_unless_protected(staged, "6.1.0").unwrap());

        assert_eq!(fs::read(binary.path()).unwrap(), b"bundled build");
        assert_eq!(binary.version().as_deref(), Some(BUNDLED_VERSION));
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 2);
    }

    #[test]
    fn test_sha256_of_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = SandboxBinary::new(dir.path());
        binary.install_bytes(b"abc", "1.0").unwrap();
        assert_eq!(
            binary.sha256().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
