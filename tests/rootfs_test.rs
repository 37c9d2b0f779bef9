mod common;

use common::{rootfs_archive, RecordingSink};
use flate2::read::GzDecoder;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use userland::cancel::CancelToken;
use userland::events::{NullSink, ProgressRange};
use userland::extract::{unpack_rootfs, UnpackOptions};

fn options(progress_every: u64) -> UnpackOptions {
    UnpackOptions {
        progress_every,
        range: ProgressRange::new(0.62, 0.74),
        expected_entries: 4,
    }
}

#[test]
fn test_unpacks_directory_executable_and_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let archive = rootfs_archive();

    let summary = unpack_rootfs(
        GzDecoder::new(archive.as_slice()),
        &root,
        &options(300),
        &CancelToken::new(),
        &NullSink,
    )
    .unwrap();

    assert_eq!(summary.entries, 4);
    assert!(!summary.cancelled);
    assert!(root.join("bin").is_dir());

    let mode = fs::metadata(root.join("bin/hello")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "execute bits lost: {mode:o}");
    let plain = fs::metadata(root.join("etc/os-release")).unwrap().permissions().mode();
    assert_eq!(plain & 0o111, 0);

    let link = root.join("bin/sh");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), std::path::PathBuf::from("hello"));
    assert_eq!(fs::read_to_string(&link).unwrap(), "#!/bin/sh\necho hello\n");
}

#[test]
fn test_cancel_stops_after_exactly_n_entries() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let archive = rootfs_archive();
    let token = CancelToken::new();
    let sink = RecordingSink::cancelling(token.clone(), 2);

    let summary = unpack_rootfs(GzDecoder::new(archive.as_slice()), &root, &options(1), &token, &sink)
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.entries, 2);
    assert!(root.join("bin").is_dir());
    assert!(root.join("bin/hello").is_file());
    assert!(!root.join("etc").exists());
    assert!(fs::symlink_metadata(root.join("bin/sh")).is_err());
}

#[test]
fn test_progress_reports_file_counts_inside_range() {
    let dir = tempfile::tempdir().unwrap();
    let archive = rootfs_archive();
    let sink = RecordingSink::default();

    unpack_rootfs(
        GzDecoder::new(archive.as_slice()),
        &dir.path().join("root"),
        &options(2),
        &CancelToken::new(),
        &sink,
    )
    .unwrap();

    assert_eq!(sink.messages(), vec!["Extracting… (2 files)", "Extracting… (4 files)"]);
    let values = sink.values();
    assert!((values[0] - 0.68).abs() < 1e-9);
    assert!((values[1] - 0.74).abs() < 1e-9);
}

#[test]
fn test_reprovisioning_overwrites_existing_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let archive = rootfs_archive();

    for _ in 0..2 {
        let summary = unpack_rootfs(
            GzDecoder::new(archive.as_slice()),
            &root,
            &options(300),
            &CancelToken::new(),
            &NullSink,
        )
        .unwrap();
        assert_eq!(summary.entries, 4);
    }
    assert_eq!(fs::read_link(root.join("bin/sh")).unwrap(), std::path::PathBuf::from("hello"));
}

#[test]
fn test_entries_below_planted_symlink_stay_inside_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let outside = dir.path().join("outside");
    fs::create_dir_all(&outside).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_mode(0o777);
    link.set_size(0);
    builder.append_link(&mut link, "evil", &outside).unwrap();
    for path in ["evil/pwned", "etc/hostname"] {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(5);
        builder.append_data(&mut header, path, &b"owned"[..]).unwrap();
    }
    let archive = builder.into_inner().unwrap();

    let summary = unpack_rootfs(archive.as_slice(), &root, &options(300), &CancelToken::new(), &NullSink)
        .unwrap();

    assert_eq!(summary.entries, 2);
    assert!(!outside.join("pwned").exists(), "entry written through a symlink");
    assert_eq!(fs::read_link(root.join("evil")).unwrap(), outside);
    assert_eq!(fs::read_to_string(root.join("etc/hostname")).unwrap(), "owned");
}
