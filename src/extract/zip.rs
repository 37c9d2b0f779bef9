use super::Candidates;
use std::io::Read;
use tracing::debug;
use zip::result::ZipResult;

/// Walk the local-file records of a zip stream and return the content of the
/// first non-directory entry matching `candidates`.
pub fn extract_named<R: Read>(mut reader: R, candidates: &Candidates) -> Option<Vec<u8>> {
    match find(&mut reader, candidates) {
        Ok(found) => found,
        Err(err) => {
            debug!(error = %err, "zip archive unreadable");
            None
        }
    }
}

fn find<R: Read>(reader: &mut R, candidates: &Candidates) -> ZipResult<Option<Vec<u8>>> {
    loop {
        let Some(mut file) = zip::read::read_zipfile_from_stream(reader)? else {
            return Ok(None);
        };
        if file.is_dir() {
            continue;
        }

        if candidates.matches(file.name()) {
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            debug!(entry = file.name(), bytes = data.len(), "found entry in zip archive");
            return Ok(Some(data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("bin/", options).unwrap();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_finds_entry_after_directory_record() {
        let archive = zip_of(&[("docs/notes.txt", b"notes"), ("bin/proot", b"zip-proot")]);
        let candidates = Candidates::new(["proot", "usr/bin/proot", "bin/proot"]);
        assert_eq!(
            extract_named(&archive[..], &candidates),
            Some(b"zip-proot".to_vec())
        );
    }

    #[test]
    fn test_no_match_is_none() {
        let archive = zip_of(&[("docs/notes.txt", b"notes")]);
        let candidates = Candidates::new(["proot"]);
        assert_eq!(extract_named(&archive[..], &candidates), None);
        assert_eq!(extract_named(&b"PK-but-not-really"[..], &candidates), None);
    }
}
