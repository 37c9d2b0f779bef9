//! Debian package (`.deb`) reader.
//!
//! A `.deb` is an `ar` archive holding `debian-binary`, `control.tar.*` and
//! `data.tar.*`. The `ar` member headers are parsed first and the binary is
//! looked up in a gzip or uncompressed `data.tar`. When the container cannot
//! be parsed, the reader falls back to scanning for gzip magic bytes and
//! trying each candidate offset as the start of a compressed tar. That scan
//! can land on `control.tar.gz` before the data member, which is why every
//! offset is tried rather than only the first.
//!
//! `data.tar.xz` and `data.tar.zst` members are not decoded.

use super::{tar, Candidates};
use tracing::debug;

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_LEN: usize = 60;
const AR_TERMINATOR: &[u8] = b"`\n";
/// gzip ID1, ID2 and the deflate compression method
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

#[derive(Debug)]
struct ArMember<'a> {
    name: &'a str,
    data: &'a [u8],
}

pub fn extract_from_deb(bytes: &[u8], candidates: &Candidates) -> Option<Vec<u8>> {
    match ar_members(bytes) {
        Some(members) => {
            if let Some(found) = from_data_member(&members, candidates) {
                return Some(found);
            }
            debug!("no usable data member in ar container, scanning for gzip streams");
        }
        None => debug!("not an ar container, scanning for gzip streams"),
    }
    scan_for_gzip(bytes, candidates)
}

fn ar_members(bytes: &[u8]) -> Option<Vec<ArMember<'_>>> {
    let mut rest = bytes.strip_prefix(AR_MAGIC)?;
    let mut members = Vec::new();

    while rest.len() >= AR_HEADER_LEN {
        let (header, body) = rest.split_at(AR_HEADER_LEN);
        if &header[58..60] != AR_TERMINATOR {
            return None;
        }
        let name = std::str::from_utf8(&header[0..16])
            .ok()?
            .trim_end()
            .trim_end_matches('/');
        let size: usize = std::str::from_utf8(&header[48..58])
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if size > body.len() {
            return None;
        }

        members.push(ArMember {
            name,
            data: &body[..size],
        });

        // Members are aligned to even offsets
        let next = (size + size % 2).min(body.len());
        rest = &body[next..];
    }

    Some(members)
}

fn from_data_member(members: &[ArMember<'_>], candidates: &Candidates) -> Option<Vec<u8>> {
    for member in members.iter().filter(|m| m.name.starts_with("data.tar")) {
        let found = match &member.name["data.tar".len()..] {
            ".gz" => tar::extract_named_gz(member.data, candidates),
            "" => tar::extract_named(member.data, candidates),
            other => {
                debug!(member = member.name, compression = other, "unsupported data member compression");
                None
            }
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn scan_for_gzip(bytes: &[u8], candidates: &Candidates) -> Option<Vec<u8>> {
    bytes
        .windows(GZIP_MAGIC.len())
        .enumerate()
        .filter(|(_, window)| *window == GZIP_MAGIC)
        .find_map(|(offset, _)| {
            let found = tar::extract_named_gz(&bytes[offset..], candidates);
            if found.is_some() {
                debug!(offset, "found binary in embedded gzip stream");
            }
            found
        })
}
