//! The batch archive format used to exchange media files: a zip
//! container with a `_meta` entry describing which archive member
//! corresponds to which real filename (or, for an empty real filename,
//! a deletion), plus the member files themselves.

use std::io::{Cursor, Read, Write};

use cardsync_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// One `_meta` entry: `(archive-member-name, real-filename)`. An empty
/// real filename marks a deletion, with the filename being removed
/// carried in the member slot instead since there is no zip member to
/// name it. A tuple struct, not a named-field one, so this serializes
/// as a bare two-element JSON array rather than an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEntry(pub String, pub String);

impl MetaEntry {
    pub fn member(&self) -> &str {
        &self.0
    }

    pub fn real_name(&self) -> &str {
        &self.1
    }
}

/// One decoded archive entry: the meta record plus the member's bytes,
/// absent for deletions.
pub struct DecodedEntry {
    pub meta: MetaEntry,
    pub bytes: Option<Vec<u8>>,
}

/// Decode an uploaded batch archive.
pub fn decode_archive(bytes: &[u8]) -> Result<Vec<DecodedEntry>> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::BadRequest(format!("invalid media archive: {e}")))?;

    let meta: Vec<MetaEntry> = {
        let mut meta_file = zip
            .by_name("_meta")
            .map_err(|_| Error::BadRequest("media archive missing _meta entry".into()))?;
        let mut raw = String::new();
        meta_file
            .read_to_string(&mut raw)
            .map_err(|e| Error::BadRequest(format!("failed to read _meta: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| Error::BadRequest(format!("invalid _meta json: {e}")))?
    };
    drop(zip);
    let mut zip = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::BadRequest(format!("invalid media archive: {e}")))?;

    let mut out = Vec::with_capacity(meta.len());
    for entry in meta {
        if entry.real_name().is_empty() {
            out.push(DecodedEntry { meta: entry, bytes: None });
            continue;
        }
        let mut member = zip.by_name(entry.member()).map_err(|_| {
            Error::BadRequest(format!("media archive missing member {}", entry.member()))
        })?;
        let mut data = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut data)
            .map_err(|e| Error::BadRequest(format!("failed to read member {}: {e}", entry.member())))?;
        drop(member);
        out.push(DecodedEntry {
            meta: entry,
            bytes: Some(data),
        });
    }
    Ok(out)
}

/// One file to package into a download archive.
pub struct OutgoingFile {
    pub real_name: String,
    pub bytes: Vec<u8>,
}

/// Encode a batch of files into a downloadable archive, numbering
/// member names sequentially to avoid filesystem-unsafe characters in
/// archive metadata.
pub fn encode_archive(files: Vec<OutgoingFile>) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(&mut buf);
    let options: FileOptions = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let meta: Vec<MetaEntry> = files
        .iter()
        .enumerate()
        .map(|(i, f)| MetaEntry(i.to_string(), f.real_name.clone()))
        .collect();

    writer
        .start_file("_meta", options)
        .map_err(|e| Error::Internal(format!("failed to start _meta entry: {e}")))?;
    let meta_json = serde_json::to_vec(&meta)?;
    writer
        .write_all(&meta_json)
        .map_err(|e| Error::Internal(format!("failed to write _meta entry: {e}")))?;

    for (i, file) in files.iter().enumerate() {
        writer
            .start_file(i.to_string(), options)
            .map_err(|e| Error::Internal(format!("failed to start member {i}: {e}")))?;
        writer
            .write_all(&file.bytes)
            .map_err(|e| Error::Internal(format!("failed to write member {i}: {e}")))?;
    }

    writer
        .finish()
        .map_err(|e| Error::Internal(format!("failed to finalize media archive: {e}")))?;
    drop(writer);
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_added_and_deleted_files() {
        let archive = encode_archive(vec![
            OutgoingFile {
                real_name: "a.jpg".into(),
                bytes: b"hello".to_vec(),
            },
            OutgoingFile {
                real_name: "b.mp3".into(),
                bytes: b"world".to_vec(),
            },
        ])
        .unwrap();

        let decoded = decode_archive(&archive).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].meta.real_name(), "a.jpg");
        assert_eq!(decoded[0].bytes.as_deref(), Some(&b"hello"[..]));
        assert_eq!(decoded[1].meta.real_name(), "b.mp3");
        assert_eq!(decoded[1].bytes.as_deref(), Some(&b"world"[..]));
    }

    #[test]
    fn meta_entries_serialize_as_positional_arrays_not_objects() {
        let archive = encode_archive(vec![OutgoingFile {
            real_name: "a.jpg".into(),
            bytes: b"hello".to_vec(),
        }])
        .unwrap();

        let mut zip = ZipArchive::new(Cursor::new(&archive[..])).unwrap();
        let mut meta_file = zip.by_name("_meta").unwrap();
        let mut raw = String::new();
        meta_file.read_to_string(&mut raw).unwrap();
        drop(meta_file);

        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.is_array(), "_meta must be an array, got {value}");
        assert!(value[0].is_array(), "each _meta entry must be a positional array, got {}", value[0]);
        assert_eq!(value[0][0], serde_json::json!("0"));
        assert_eq!(value[0][1], serde_json::json!("a.jpg"));
    }

    #[test]
    fn decoding_rejects_an_archive_without_meta() {
        let mut buf = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut buf);
        writer
            .start_file("not_meta", FileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();
        drop(writer);

        let err = decode_archive(&buf.into_inner()).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
