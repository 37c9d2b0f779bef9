use super::Candidates;
use flate2::read::GzDecoder;
use std::io::{self, Read};
use tracing::debug;

/// Return the content of the first regular-file entry, in stream order, that
/// matches `candidates`. Reading stops at the match.
pub fn extract_named<R: Read>(reader: R, candidates: &Candidates) -> Option<Vec<u8>> {
    match find(reader, candidates) {
        Ok(found) => found,
        Err(err) => {
            debug!(error = %err, "tar archive unreadable");
            None
        }
    }
}

/// [`extract_named`] over a gzip-compressed tar stream.
pub fn extract_named_gz<R: Read>(reader: R, candidates: &Candidates) -> Option<Vec<u8>> {
    extract_named(GzDecoder::new(reader), candidates)
}

fn find<R: Read>(reader: R, candidates: &Candidates) -> io::Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry.path()?.to_string_lossy().into_owned();
        if candidates.matches(&name) {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            debug!(entry = %name, bytes = data.len(), "found entry in tar archive");
            return Ok(Some(data));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_finds_entry_under_alias() {
        let archive = tar_gz(&[
            ("data/README", b"readme"),
            ("data/usr/bin/proot", b"proot-bytes"),
        ]);
        let candidates = Candidates::new(["proot", "usr/bin/proot"]);
        assert_eq!(
            extract_named_gz(&archive[..], &candidates),
            Some(b"proot-bytes".to_vec())
        );
    }

    #[test]
    fn test_first_match_in_stream_order_wins() {
        let archive = tar_gz(&[("bin/proot", b"first"), ("usr/bin/proot", b"second")]);
        let candidates = Candidates::new(["usr/bin/proot", "bin/proot"]);
        assert_eq!(extract_named_gz(&archive[..], &candidates), Some(b"first".to_vec()));
    }

    #[test]
    fn test_missing_entry_and_garbage_are_none() {
        let archive = tar_gz(&[("etc/motd", b"hi")]);
        let candidates = Candidates::new(["proot"]);
        assert_eq!(extract_named_gz(&archive[..], &candidates), None);
        assert_eq!(extract_named_gz(&b"definitely not gzip"[..], &candidates), None);
    }
}
