use super::{version_from_url, UNKNOWN_VERSION};
use crate::env::Arch;
use crate::error::Result;
use crate::transfer::TransferClient;
use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

/// The subset of a GitHub release listing entry that acquisition needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
}

/// A downloadable sandbox binary found in the release listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub url: String,
    pub version: String,
}

pub fn parse_releases(json: &str) -> Result<Vec<Release>> {
    let releases = serde_json::from_str(json).context("Malformed release listing")?;
    Ok(releases)
}

/// First asset, in listing order, whose download URL names proot and whose
/// asset name carries the architecture token.
pub fn find_asset(releases: &[Release], arch: Arch) -> Option<ReleaseAsset> {
    releases.iter().find_map(|release| {
        release
            .assets
            .iter()
            .find(|asset| {
                asset.browser_download_url.contains("proot") && asset.name.contains(arch.as_str())
            })
            .map(|asset| ReleaseAsset {
                url: asset.browser_download_url.clone(),
                version: version_from_url(&asset.browser_download_url)
                    .or_else(|| tag_version(&release.tag_name))
                    .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            })
    })
}

fn tag_version(tag: &str) -> Option<String> {
    let version = tag.trim_start_matches('v');
    let numeric = !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.');
    numeric.then(|| version.to_string())
}

/// Query the release listing and pick the asset for `arch`.
pub fn latest_asset(client: &TransferClient, api_url: &str, arch: Arch) -> Result<Option<ReleaseAsset>> {
    let json = client.fetch_text(api_url)?;
    let releases = parse_releases(&json)?;
    let asset = find_asset(&releases, arch);
    debug!(api_url, releases = releases.len(), found = ?asset, "queried release listing");
    Ok(asset)
}
