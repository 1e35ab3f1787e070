//! Schema compatibility layer.
//!
//! Column names and counts differ across the on-disk schema versions a
//! collection file may carry. Rather than hardcoding every version's
//! layout, this module exposes a small, stable set of tables the sync
//! engine touches, each described by an ordered list of columns and
//! their JSON serialization kind. Row values are always shuttled as
//! opaque [`serde_json::Value`] tuples keyed by this descriptor, never
//! as named structs tied to one schema generation.

use cardsync_core::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// The lowest schema version this layer understands natively.
pub const MIN_SUPPORTED_VERSION: u8 = 11;

/// The highest schema version this layer understands natively.
pub const MAX_SUPPORTED_VERSION: u8 = 18;

/// A collection's on-disk schema generation.
///
/// Versions below [`MIN_SUPPORTED_VERSION`] are rejected outright (too
/// old to reason about safely). Versions above [`MAX_SUPPORTED_VERSION`]
/// are not rejected — an unknown future version degrades to the
/// conservative subset of columns common across the supported range
/// rather than refusing to serve the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaVersion(pub u8);

impl SchemaVersion {
    pub fn is_future(self) -> bool {
        self.0 > MAX_SUPPORTED_VERSION
    }

    pub fn from_raw(raw: i64) -> Result<Self> {
        if raw < MIN_SUPPORTED_VERSION as i64 {
            return Err(Error::SchemaLock(format!(
                "schema version {raw} predates the minimum supported version {MIN_SUPPORTED_VERSION}"
            )));
        }
        // Clamp absurdly large values defensively; real collections never
        // carry a version outside u8 range.
        let clamped = raw.min(255) as u8;
        Ok(SchemaVersion(clamped))
    }
}

/// The sync-relevant tables, in the stable enumeration order the
/// streaming protocol uses when splitting changes into chunks.
///
/// `Config` is a singleton blob, not a per-row USN table — `schema`'s
/// sync functions special-case it rather than routing it through the
/// generic column-based enumeration and merge logic the other variants
/// share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableId {
    Notes,
    Cards,
    Revlog,
    Decks,
    DeckConfigs,
    NoteTypes,
    Tags,
    Config,
}

impl TableId {
    /// All sync-relevant tables, in streaming order.
    pub const ALL: [TableId; 8] = [
        TableId::Notes,
        TableId::Cards,
        TableId::Revlog,
        TableId::Decks,
        TableId::DeckConfigs,
        TableId::NoteTypes,
        TableId::Tags,
        TableId::Config,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TableId::Notes => "notes",
            TableId::Cards => "cards",
            TableId::Revlog => "revlog",
            TableId::Decks => "decks",
            TableId::DeckConfigs => "deck_configs",
            TableId::NoteTypes => "note_types",
            TableId::Tags => "tags",
            TableId::Config => "config",
        }
    }

    /// The underlying SQLite table name for this schema version. For
    /// every version currently supported this coincides with the
    /// sync-facing name; kept as a seam for future schema generations
    /// that rename tables.
    pub fn sql_table_name(self, _version: SchemaVersion) -> &'static str {
        self.as_str()
    }
}

/// How a column's value must be serialized to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerKind {
    /// Serialized as a JSON integer.
    Int,
    /// Serialized as a JSON string, even though the backing column is
    /// numeric — used for object identifiers in graves and for note
    /// checksums, which can exceed the 53-bit precision JSON numbers
    /// carry safely on some receiving platforms.
    IntAsString,
    /// Serialized as a JSON string backed by a text column.
    Text,
}

/// One column of a sync-relevant table.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: SerKind,
}

const fn col(name: &'static str, kind: SerKind) -> ColumnSpec {
    ColumnSpec { name, kind }
}

/// The column descriptor for a table, valid for every supported schema
/// version. A future, unrecognized version falls back to this same
/// conservative subset rather than guessing at newer columns.
pub fn columns_for(table: TableId) -> &'static [ColumnSpec] {
    match table {
        TableId::Notes => &[
            col("id", SerKind::Int),
            col("guid", SerKind::Text),
            col("mid", SerKind::Int),
            col("mod", SerKind::Int),
            col("usn", SerKind::Int),
            col("tags", SerKind::Text),
            col("flds", SerKind::Text),
            col("sfld", SerKind::Text),
            col("csum", SerKind::IntAsString),
            col("flags", SerKind::Int),
            col("data", SerKind::Text),
        ],
        TableId::Cards => &[
            col("id", SerKind::Int),
            col("nid", SerKind::Int),
            col("did", SerKind::Int),
            col("ord", SerKind::Int),
            col("mod", SerKind::Int),
            col("usn", SerKind::Int),
            col("type", SerKind::Int),
            col("queue", SerKind::Int),
            col("due", SerKind::Int),
            col("ivl", SerKind::Int),
            col("factor", SerKind::Int),
            col("reps", SerKind::Int),
            col("lapses", SerKind::Int),
            col("left", SerKind::Int),
            col("odue", SerKind::Int),
            col("odid", SerKind::Int),
            col("flags", SerKind::Int),
            col("data", SerKind::Text),
        ],
        TableId::Revlog => &[
            col("id", SerKind::Int),
            col("cid", SerKind::Int),
            col("usn", SerKind::Int),
            col("ease", SerKind::Int),
            col("ivl", SerKind::Int),
            col("lastivl", SerKind::Int),
            col("factor", SerKind::Int),
            col("time", SerKind::Int),
            col("type", SerKind::Int),
        ],
        TableId::Decks => &[
            col("id", SerKind::Int),
            col("name", SerKind::Text),
            col("mod", SerKind::Int),
            col("usn", SerKind::Int),
            col("common", SerKind::Text),
            col("kind", SerKind::Text),
        ],
        TableId::DeckConfigs => &[
            col("id", SerKind::Int),
            col("name", SerKind::Text),
            col("mod", SerKind::Int),
            col("usn", SerKind::Int),
            col("config", SerKind::Text),
        ],
        TableId::NoteTypes => &[
            col("id", SerKind::Int),
            col("name", SerKind::Text),
            col("mod", SerKind::Int),
            col("usn", SerKind::Int),
            col("config", SerKind::Text),
        ],
        TableId::Tags => &[col("tag", SerKind::Text), col("usn", SerKind::Int)],
        // Never actually queried through this descriptor: `Config` is
        // special-cased in `sync_tables` before `columns_for` is
        // consulted. Present only so this match stays exhaustive.
        TableId::Config => &[col("val", SerKind::Text)],
    }
}

/// Index of the `usn` column within [`columns_for`], used by the merge
/// and enumeration logic. Every row-based sync table carries one; the
/// singleton `Config` blob has no `usn` column and must never reach
/// this function.
pub fn usn_column_index(table: TableId) -> usize {
    columns_for(table)
        .iter()
        .position(|c| c.name == "usn")
        .expect("every sync table has a usn column")
}

/// Index of the `mod` column, when the table has one. Revlog and tags
/// have no independent modification timestamp; conflicts there are
/// resolved purely by USN order.
pub fn mod_column_index(table: TableId) -> Option<usize> {
    columns_for(table).iter().position(|c| c.name == "mod")
}

/// Index of the primary-key column (always the first column when
/// present; tags key on their text value instead).
pub fn primary_key_index(table: TableId) -> Option<usize> {
    match table {
        TableId::Tags => None,
        _ => Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_versions_below_minimum() {
        assert!(SchemaVersion::from_raw(10).is_err());
    }

    #[test]
    fn accepts_versions_within_supported_range() {
        let v = SchemaVersion::from_raw(11).unwrap();
        assert_eq!(v.0, 11);
        assert!(!v.is_future());
    }

    #[test]
    fn future_versions_are_marked_but_accepted() {
        let v = SchemaVersion::from_raw(30).unwrap();
        assert!(v.is_future());
    }

    #[test]
    fn every_row_based_table_has_a_usn_column() {
        for table in TableId::ALL {
            if table == TableId::Config {
                continue;
            }
            let idx = usn_column_index(table);
            assert_eq!(columns_for(table)[idx].kind, SerKind::Int);
        }
    }

    #[test]
    fn grave_and_checksum_columns_serialize_as_strings() {
        let notes_cols = columns_for(TableId::Notes);
        let csum = notes_cols.iter().find(|c| c.name == "csum").unwrap();
        assert_eq!(csum.kind, SerKind::IntAsString);
    }
}
