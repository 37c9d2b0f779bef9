//! Archive readers.
//!
//! Two kinds of operation live here. The "extract one named file" readers
//! ([`tar`], [`zip`], [`deb`]) look for an entry matching any of a set of
//! candidate paths and return its bytes; they never fail past their boundary,
//! a missing entry and a malformed archive both come back as `None` so the
//! caller can move on to its next source. [`rootfs`] unpacks a whole
//! compressed tar onto disk.

pub mod deb;
pub mod rootfs;
pub mod tar;
pub mod zip;

pub use rootfs::{unpack_rootfs, UnpackOptions, UnpackSummary};

/// Relative paths an entry may be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    paths: Vec<String>,
}

impl Candidates {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| normalize(p.as_ref()).to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { paths }
    }

    /// An entry matches when its normalized name equals a candidate or ends
    /// with `/<candidate>`.
    pub fn matches(&self, entry_name: &str) -> bool {
        let name = normalize(entry_name);
        self.paths.iter().any(|candidate| {
            name == candidate
                || name
                    .strip_suffix(candidate.as_str())
                    .is_some_and(|prefix| prefix.ends_with('/'))
        })
    }
}

/// Strip leading `./` and `/` segments from an archive entry name.
pub fn normalize(name: &str) -> &str {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else if name == "." {
            return "";
        } else {
            return name;
        }
    }
}
