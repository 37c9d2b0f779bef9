use super::{
    release, spawn_background_update, version_from_url, SandboxSource, SourceFormat,
    BINARY_CANDIDATES, BUNDLED_VERSION, PINNED_VERSION,
};
use crate::cancel::CancelToken;
use crate::env::Arch;
use crate::error::{Error, Result};
use crate::extract::{self, Candidates};
use crate::toolkit::Toolkit;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Where the installed sandbox binary came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A valid binary was already present
    Existing,
    Bundled,
    Release,
    /// Index into the static source list
    Mirror(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub path: PathBuf,
    pub version: String,
    pub origin: Origin,
}

/// Makes sure a usable sandbox binary is installed, acquiring one if needed.
///
/// Sources are tried in order: the existing binary, the bundled copy, the
/// newest release listed by the release API, then the static mirror list.
/// Each failed source is recorded and the next one tried; only when all of
/// them fail is [`Error::AcquisitionExhausted`] returned.
pub struct Resolver<'a> {
    toolkit: &'a Toolkit,
    arch: Arch,
}

impl<'a> Resolver<'a> {
    pub fn new(toolkit: &'a Toolkit) -> Self {
        Self {
            toolkit,
            arch: toolkit.arch(),
        }
    }

    pub fn ensure(&self, cancel: &CancelToken) -> Result<Resolution> {
        let binary = &self.toolkit.binary;
        let config = &self.toolkit.config;

        if binary.is_valid(config.min_binary_size) {
            self.toolkit.progress("proot already ready ✅", 0.06);
            if config.auto_update {
                spawn_background_update(self.toolkit.clone());
            }
            return Ok(Resolution {
                path: binary.path().to_path_buf(),
                version: binary.version().unwrap_or_else(|| super::UNKNOWN_VERSION.to_string()),
                origin: Origin::Existing,
            });
        }

        self.toolkit.progress("Getting proot binary…", 0.04);
        let mut causes = Vec::new();

        match self.from_bundled() {
            Ok(resolution) => {
                self.toolkit.progress("✅ proot loaded from bundled copy (no download needed)", 0.08);
                return Ok(resolution);
            }
            Err(err) => {
                debug!(error = %err, "bundled copy unavailable");
                causes.push(format!("Bundled copy: {err}"));
            }
        }

        cancel.check()?;
        self.toolkit.progress("Checking release listing for proot binary…", 0.05);
        match self.from_release() {
            Ok(resolution) => {
                self.toolkit.progress(format!("✅ proot {} downloaded", resolution.version), 0.09);
                return Ok(resolution);
            }
            Err(err) => {
                warn!(error = %err, "release listing did not yield a binary");
                causes.push(format!("Release listing: {err}"));
            }
        }

        let sources = SandboxSource::resolve_list(config, self.arch);
        for (index, source) in sources.iter().enumerate() {
            cancel.check()?;
            self.toolkit.progress(
                format!("Trying source {}/{}…", index + 1, sources.len()),
                0.05 + index as f64 * 0.008,
            );
            match self.from_source(index, source) {
                Ok(resolution) => {
                    self.toolkit.progress(format!("✅ proot ready! (source {})", index + 1), 0.09);
                    return Ok(resolution);
                }
                Err(err) => {
                    warn!(source = index + 1, url = %source.url, error = %err, "sandbox source failed");
                    causes.push(format!("Source {}: {}", index + 1, truncate(&err.to_string(), 160)));
                }
            }
        }

        Err(Error::AcquisitionExhausted { causes })
    }

    fn from_bundled(&self) -> Result<Resolution> {
        let dir = self
            .toolkit
            .config
            .bundled_dir
            .as_ref()
            .ok_or_else(|| Error::not_found("no bundled directory configured"))?;
        let asset = dir.join(self.arch.bundled_asset_name());
        if !asset.is_file() {
            return Err(Error::not_found(asset.display().to_string()));
        }

        let staged = self.toolkit.binary.staging_file("proot-bundled")?;
        fs::copy(&asset, staged.path())?;
        self.accept(staged, BUNDLED_VERSION, Origin::Bundled)
    }

    fn from_release(&self) -> Result<Resolution> {
        let api_url = &self.toolkit.config.release_api_url;
        let asset = release::latest_asset(&self.toolkit.client, api_url, self.arch)?
            .ok_or_else(|| Error::not_found(format!("release asset for {}", self.arch)))?;

        self.toolkit.progress(format!("Found proot binary: {}", asset.url), 0.06);
        let staged = self.toolkit.binary.staging_file("proot-release")?;
        self.toolkit.client.fetch_to_file(&asset.url, staged.path())?;
        self.accept(staged, &asset.version, Origin::Release)
    }

    fn from_source(&self, index: usize, source: &SandboxSource) -> Result<Resolution> {
        let staged = self
            .toolkit
            .binary
            .staging_file(&format!("proot_download_{index}_"))?;
        self.toolkit.client.fetch_to_file(&source.url, staged.path())?;

        let version = version_from_url(&source.url).unwrap_or_else(|| PINNED_VERSION.to_string());
        let origin = Origin::Mirror(index);
        let candidates = Candidates::new(BINARY_CANDIDATES);

        let extracted = match source.format {
            SourceFormat::Binary => return self.accept(staged, &version, origin),
            SourceFormat::TarGz => {
                extract::tar::extract_named_gz(BufReader::new(File::open(staged.path())?), &candidates)
            }
            SourceFormat::Zip => {
                extract::zip::extract_named(BufReader::new(File::open(staged.path())?), &candidates)
            }
            SourceFormat::Deb => extract::deb::extract_from_deb(&fs::read(staged.path())?, &candidates),
        };
        drop(staged);

        let data = extracted
            .ok_or_else(|| Error::extraction(format!("no proot entry in {:?} archive", source.format)))?;
        self.check_size(data.len() as u64)?;
        self.toolkit.binary.install_bytes(&data, &version)?;
        self.resolved(&version, origin)
    }

    fn accept(&self, staged: NamedTempFile, version: &str, origin: Origin) -> Result<Resolution> {
        self.check_size(file_len(staged.path())?)?;
        self.toolkit.binary.install(staged, version)?;
        self.resolved(version, origin)
    }

    fn check_size(&self, len: u64) -> Result<()> {
        let min = self.toolkit.config.min_binary_size;
        if len > min {
            Ok(())
        } else {
            Err(Error::extraction(format!(
                "payload too small to be proot ({len} bytes, need more than {min})"
            )))
        }
    }

    fn resolved(&self, version: &str, origin: Origin) -> Result<Resolution> {
        info!(version, origin = ?origin, "sandbox binary acquired");
        Ok(Resolution {
            path: self.toolkit.binary.path().to_path_buf(),
            version: version.to_string(),
            origin,
        })
    }
}

fn file_len(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &message[..cut]),
        None => message.to_string(),
    }
}
