use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::events::{EventSink, Progress, ProgressRange};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct UnpackOptions {
    /// Emit a progress event every this many entries
    pub progress_every: u64,
    pub range: ProgressRange,
    /// Entry count that maps to the end of `range`
    pub expected_entries: u64,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            progress_every: 300,
            range: ProgressRange::new(0.0, 1.0),
            expected_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackSummary {
    pub entries: u64,
    pub cancelled: bool,
}

/// Unpack every entry of a tar stream below `dest`: directories, regular files
/// (with execute permission when any execute bit is set in the entry mode),
/// symbolic and hard links. The token is checked before each entry; a
/// cancelled unpack returns normally with `cancelled` set, leaving the entries
/// written so far in place.
pub fn unpack_rootfs<R: Read>(
    reader: R,
    dest: &Path,
    options: &UnpackOptions,
    cancel: &CancelToken,
    sink: &dyn EventSink,
) -> Result<UnpackSummary> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    let mut count = 0u64;

    for entry in archive.entries().map_err(corrupt)? {
        if cancel.is_cancelled() {
            info!(entries = count, "extraction cancelled");
            return Ok(UnpackSummary {
                entries: count,
                cancelled: true,
            });
        }

        let mut entry = entry.map_err(corrupt)?;
        let relative = entry.path().map_err(corrupt)?.into_owned();
        let Some(target) = resolve_inside(dest, &relative) else {
            warn!(path = %relative.display(), "skipping entry outside the root");
            continue;
        };
        if crosses_symlink(dest, &target) {
            warn!(path = %relative.display(), "skipping entry below a symlink");
            continue;
        }

        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);

        if kind.is_dir() {
            create_dir(&target, mode)?;
        } else if kind.is_symlink() {
            let link = link_name(&entry, &relative)?;
            create_symlink(&link, &target)?;
        } else if kind.is_hard_link() {
            let link = link_name(&entry, &relative)?;
            match resolve_inside(dest, &link).filter(|source| !crosses_symlink(dest, source)) {
                Some(source) => create_hard_link(&source, &target)?,
                None => {
                    warn!(path = %relative.display(), "skipping hard link outside the root");
                    continue;
                }
            }
        } else if kind.is_file() {
            write_file(&mut entry, &target, mode)?;
        } else {
            debug!(path = %relative.display(), kind = ?kind, "skipping special entry");
            continue;
        }

        count += 1;
        if options.progress_every > 0 && count % options.progress_every == 0 {
            let fraction = count as f64 / options.expected_entries.max(1) as f64;
            sink.progress(Progress::new(
                format!("Extracting… ({count} files)"),
                options.range.at(fraction),
            ));
        }
    }

    info!(entries = count, dest = %dest.display(), "extraction complete");
    Ok(UnpackSummary {
        entries: count,
        cancelled: false,
    })
}

fn corrupt(err: io::Error) -> Error {
    Error::extraction(format!("corrupt archive: {err}"))
}

fn link_name<R: Read>(entry: &tar::Entry<'_, R>, relative: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .map_err(corrupt)?
        .map(|link| link.into_owned())
        .ok_or_else(|| {
            Error::extraction(format!("link entry {} has no target", relative.display()))
        })
}

/// Join an archive path onto `root`, refusing anything that climbs out of it.
fn resolve_inside(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// Whether any directory between `root` and `target` is a symlink, which an
/// earlier entry of the same archive may have pointed anywhere on the host.
fn crosses_symlink(root: &Path, target: &Path) -> bool {
    let Ok(relative) = target.strip_prefix(root) else {
        return true;
    };
    let Some(parent) = relative.parent() else {
        return false;
    };
    let mut current = root.to_path_buf();
    parent.components().any(|component| {
        current.push(component);
        fs::symlink_metadata(&current).is_ok_and(|meta| meta.file_type().is_symlink())
    })
}

/// Drop whatever non-directory already sits at `path`, so re-provisioning
/// never writes through a stale symlink.
fn clear_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path),
        _ => Ok(()),
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    clear_existing(path)?;
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777 | 0o700))
}

fn write_file<R: Read>(reader: &mut R, path: &Path, mode: u32) -> io::Result<()> {
    ensure_parent(path)?;
    clear_existing(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    io::copy(reader, &mut out)?;
    out.flush()?;
    fs::set_permissions(path, fs::Permissions::from_mode(file_mode(mode)))
}

/// Owner can always rewrite the file; any execute bit makes it executable for all.
fn file_mode(mode: u32) -> u32 {
    let mut derived = mode & 0o777 | 0o600;
    if mode & 0o111 != 0 {
        derived |= 0o111;
    }
    derived
}

fn create_symlink(link: &Path, path: &Path) -> io::Result<()> {
    ensure_parent(path)?;
    clear_existing(path)?;
    symlink(link, path)
}

fn create_hard_link(source: &Path, path: &Path) -> io::Result<()> {
    ensure_parent(path)?;
    clear_existing(path)?;
    fs::hard_link(source, path).or_else(|err| {
        debug!(error = %err, path = %path.display(), "hard link failed, copying");
        fs::copy(source, path).map(|_| ())
    })
}
