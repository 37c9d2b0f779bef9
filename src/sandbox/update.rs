use super::{release, BUNDLED_VERSION, UNKNOWN_VERSION};
use crate::error::Result;
use crate::toolkit::Toolkit;
use serde::{Deserialize, Serialize};
use std::fs;
use std::thread::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateReport {
    fn unchanged(version: Option<String>, reason: Option<&str>) -> Self {
        Self {
            updated: false,
            version,
            reason: reason.map(str::to_string),
            error: None,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Replace the sandbox binary when the release listing offers a newer version.
///
/// A binary whose marker says it was bundled is never replaced. The new binary
/// is staged next to the old one and renamed over it, then the caller is
/// notified through the event sink.
pub fn check_for_update(toolkit: &Toolkit) -> Result<UpdateReport> {
    let binary = &toolkit.binary;
    if !binary.exists() {
        return Ok(UpdateReport::unchanged(None, Some("proot not installed")));
    }

    let installed = binary
        .version()
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
    if installed == BUNDLED_VERSION {
        return Ok(UpdateReport::unchanged(
            Some(installed),
            Some("bundled proot is never replaced automatically"),
        ));
    }

    let arch = toolkit.arch();
    let Some(asset) = release::latest_asset(&toolkit.client, &toolkit.config.release_api_url, arch)?
    else {
        return Ok(UpdateReport::unchanged(
            Some(installed),
            Some("no release asset for this architecture"),
        ));
    };

    if !is_newer(&asset.version, &installed) {
        debug!(installed, latest = %asset.version, "sandbox binary up to date");
        return Ok(UpdateReport::unchanged(Some(installed), None));
    }

    let staged = binary.staging_file("proot_update")?;
    toolkit.client.fetch_to_file(&asset.url, staged.path())?;
    let len = fs::metadata(staged.path())?.len();
    if len <= toolkit.config.min_binary_size {
        return Ok(UpdateReport::unchanged(
            Some(installed),
            Some("downloaded update is too small to be proot"),
        ));
    }

    if !binary.install_unless_protected(staged, &asset.version)? {
        return Ok(UpdateReport::unchanged(
            Some(BUNDLED_VERSION.to_string()),
            Some("bundled proot is never replaced automatically"),
        ));
    }
    info!(from = %installed, to = %asset.version, "sandbox binary updated");
    toolkit.sink.sandbox_updated(&asset.version);

    Ok(UpdateReport {
        updated: true,
        version: Some(asset.version),
        reason: None,
        error: None,
    })
}

/// Run [`check_for_update`] on a background thread. Every failure is logged
/// and dropped.
pub fn spawn_background_update(toolkit: Toolkit) -> Option<JoinHandle<()>> {
    let spawned = std::thread::Builder::new()
        .name("proot-update".to_string())
        .spawn(move || match check_for_update(&toolkit) {
            Ok(report) => debug!(?report, "background update check finished"),
            Err(err) => debug!(error = %err, "background update check failed"),
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            debug!(error = %err, "could not start background update check");
            None
        }
    }
}

/// Whether dotted version `candidate` is strictly greater than `installed`.
/// An unparsable installed version is always superseded by a parsable candidate.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    match (parse_version(candidate), parse_version(installed)) {
        (Some(candidate), Some(installed)) => candidate > installed,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim().trim_start_matches('v');
    if version.is_empty() {
        return None;
    }
    let mut parts: Vec<u64> = version
        .split('.')
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;
    while parts.len() > 1 && parts.last() == Some(&0) {
        parts.pop();
    }
    Some(parts)
}
