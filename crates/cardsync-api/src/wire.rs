//! On-the-wire JSON shapes for every `/sync/*` and `/msync/*` endpoint.
//!
//! Two type rules apply everywhere in this module and are enforced by
//! construction rather than by convention: object identifiers inside a
//! [`GraveWire`] are always strings, and every other integer field
//! (including every `Row` value the schema compatibility layer didn't
//! already mark as string-serialized) stays a JSON number.

use std::collections::HashMap;

use cardsync_db::sync_tables::Row;
use serde::{Deserialize, Serialize};

/// `/sync/hostKey` request. Both fields are absent on a discovery
/// probe.
#[derive(Debug, Clone, Deserialize)]
pub struct HostKeyRequest {
    #[serde(default)]
    pub u: Option<String>,
    #[serde(default)]
    pub p: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostKeyResponse {
    pub key: String,
    pub host: String,
}

/// `/sync/meta` request: the client's local state plus its protocol
/// version and build identifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaRequest {
    #[serde(rename = "mod")]
    pub mod_: i64,
    pub usn: i64,
    pub scm: i64,
    #[serde(rename = "ver")]
    pub protocol_version: u32,
    #[serde(default)]
    pub client: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetaResponse {
    #[serde(rename = "mod")]
    pub mod_: i64,
    pub scm: i64,
    pub usn: i64,
    pub ts: i64,
    pub musn: i64,
    pub uname: String,
    pub msg: String,
    pub cont: bool,
    pub empty: bool,
    /// Historical sharding hint; a self-hosted server always emits 0.
    pub host_num: u32,
}

/// A deletion tombstone as it travels over the wire: the object id is
/// always a string even though it is numeric internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraveWire {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub min_usn: i64,
    pub max_usn: i64,
    #[serde(default)]
    pub lnewer: bool,
    #[serde(default)]
    pub graves: Vec<GraveWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub graves: Vec<GraveWire>,
}

/// A table name to row list mapping, used both inside `applyChanges`
/// and inside a streaming `chunk`.
pub type TableRows = HashMap<String, Vec<Row>>;

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyChangesRequest {
    pub changes: TableRows,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyChangesResponse {
    pub changes: TableRows,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub done: bool,
    pub tables: TableRows,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyChunkRequest {
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub chunk: Chunk,
}

/// The deterministic per-table count vector compared at the end of
/// streaming. Order matches [`cardsync_db::schema::TableId::ALL`] plus
/// graves and config, fixed-length so a short/long vector from a buggy
/// client is itself detectable as a mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanityVector {
    pub notes: i64,
    pub cards: i64,
    pub revlog: i64,
    pub graves: i64,
    pub decks: i64,
    pub deck_configs: i64,
    pub note_types: i64,
    pub tags: i64,
    pub config: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SanityCheckRequest {
    pub client: SanityVector,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanityCheckResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishResponse {
    #[serde(rename = "mod")]
    pub mod_: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
}

/// `/msync/begin` response envelope; media endpoints wrap their
/// payload in `{data, err}` rather than returning it bare (except
/// `mediaChanges`, which is a bare array by client convention).
#[derive(Debug, Clone, Serialize)]
pub struct MediaEnvelope<T> {
    pub data: T,
    pub err: String,
}

impl<T> MediaEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data,
            err: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeginRequest {
    #[serde(default)]
    pub sk: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeginData {
    pub usn: i64,
    pub sk: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaChangesRequest {
    pub last_usn: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaChangeEntry(pub String, pub i64, pub String);

#[derive(Debug, Clone, Serialize)]
pub struct UploadChangesData {
    pub processed: usize,
    pub current_usn: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadFilesRequest {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaSanityRequest {
    pub local: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grave_wire_id_serializes_as_a_json_string() {
        let grave = GraveWire {
            kind: "card".into(),
            id: "123456789012345".into(),
        };
        let json = serde_json::to_value(&grave).unwrap();
        assert!(json["id"].is_string());
    }

    #[test]
    fn meta_request_accepts_the_mod_keyword_field() {
        let raw = r#"{"mod":1000,"usn":5,"scm":2000,"ver":11,"client":"desktop"}"#;
        let req: MetaRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.mod_, 1000);
        assert_eq!(req.protocol_version, 11);
    }

    #[test]
    fn media_changes_entry_serializes_as_a_bare_tuple_array() {
        let entry = MediaChangeEntry("a.jpg".into(), 3, "abc".into());
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0], serde_json::json!("a.jpg"));
    }
}
