//! Filesystem bag holding the raw bytes of a user's media files.

use std::path::PathBuf;

use cardsync_core::error::{Error, Result};
use sha1::{Digest, Sha1};
use unicode_normalization::UnicodeNormalization;

/// Names that are reserved on case-insensitive/Windows-flavored
/// filesystems and must never be written verbatim.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Normalize a client-supplied filename: NFC-normalize, strip path
/// separators, and avoid filesystem-reserved stems.
pub fn normalize_filename(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::BadRequest("empty media filename".into()));
    }
    let normalized: String = raw.nfc().collect();
    if normalized.contains('/') || normalized.contains('\\') || normalized.contains("..") {
        return Err(Error::BadRequest(format!(
            "media filename contains a path separator: {raw}"
        )));
    }
    let stem = normalized.split('.').next().unwrap_or(&normalized).to_ascii_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return Ok(format!("_{normalized}"));
    }
    Ok(normalized)
}

/// SHA-1 of raw bytes, hex-encoded, matching the hash the media log
/// stores per entry.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The filesystem bag for one user's media directory.
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, fname: &str) -> PathBuf {
        self.root.join(fname)
    }

    /// Write `bytes` under a normalized version of `fname`, creating the
    /// directory if needed. Returns the normalized name actually used.
    pub fn write(&self, fname: &str, bytes: &[u8]) -> Result<String> {
        std::fs::create_dir_all(&self.root)?;
        let normalized = normalize_filename(fname)?;
        std::fs::write(self.path_for(&normalized), bytes)?;
        Ok(normalized)
    }

    /// Remove the file backing `fname`, if present. Absence is not an
    /// error — deleting an already-missing file is idempotent.
    pub fn remove(&self, fname: &str) -> Result<()> {
        let normalized = normalize_filename(fname)?;
        match std::fs::remove_file(self.path_for(&normalized)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&self, fname: &str) -> Result<Vec<u8>> {
        let normalized = normalize_filename(fname)?;
        std::fs::read(self.path_for(&normalized)).map_err(Error::from)
    }

    pub fn exists(&self, fname: &str) -> bool {
        normalize_filename(fname)
            .map(|n| self.path_for(&n).exists())
            .unwrap_or(false)
    }
}
