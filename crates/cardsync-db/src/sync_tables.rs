//! Change enumeration, merge, and grave handling for the sync-relevant
//! tables exposed by the schema compatibility layer.

use cardsync_core::error::{Error, Result};
use cardsync_core::usn::Usn;
use rusqlite::{params_from_iter, types::ValueRef, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::instrument;

use crate::collection::CollectionHandle;
use crate::schema::{columns_for, mod_column_index, primary_key_index, usn_column_index, SerKind, TableId};

/// One row of a sync-relevant table, serialized per its column
/// descriptor: an ordered tuple, not a named struct, since column sets
/// vary across schema versions.
pub type Row = Vec<Json>;

/// A deletion tombstone. `kind` names the table the deleted object
/// belonged to; `id` is always serialized as a string regardless of the
/// backing column's numeric type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grave {
    pub kind: String,
    pub id: String,
    pub usn: i64,
}

/// Enumerate every row across every sync-relevant table whose USN is
/// strictly greater than `since`, in the stable table order the
/// streaming protocol expects.
///
/// `Config` has no per-row USN to filter by, so it streams
/// unconditionally as a single synthetic row rather than going through
/// `read_rows_since`. It is fetched after the generic per-table query
/// closure returns, since [`read_config`] takes its own connection lock
/// and `with_conn` is not reentrant.
#[instrument(skip(handle))]
pub fn enumerate_changes(handle: &CollectionHandle, since: Usn) -> Result<Vec<(TableId, Vec<Row>)>> {
    let mut out = handle.with_conn(|conn| {
        let mut out = Vec::with_capacity(TableId::ALL.len());
        for table in TableId::ALL {
            if table == TableId::Config {
                continue;
            }
            let rows = read_rows_since(conn, table, since)?;
            out.push((table, rows));
        }
        Ok(out)
    })?;

    let config = read_config(handle)?;
    out.push((TableId::Config, vec![vec![config]]));
    Ok(out)
}

fn read_rows_since(conn: &Connection, table: TableId, since: Usn) -> Result<Vec<Row>> {
    let cols = columns_for(table);
    let usn_idx = usn_column_index(table);
    let col_list = cols.iter().map(|c| c.name).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT {col_list} FROM {} WHERE {} > ?1",
        table.as_str(),
        cols[usn_idx].name
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::Internal(format!("failed to prepare enumeration query: {e}")))?;
    let rows = stmt
        .query_map([since.0], |row| {
            let mut values = Vec::with_capacity(cols.len());
            for (i, col) in cols.iter().enumerate() {
                values.push(value_to_json(row.get_ref(i)?, col.kind));
            }
            Ok(values)
        })
        .map_err(|e| Error::Internal(format!("failed to enumerate rows: {e}")))?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| Error::Internal(format!("failed to read row: {e}")))?);
    }
    Ok(out)
}

fn value_to_json(v: ValueRef<'_>, kind: SerKind) -> Json {
    match (v, kind) {
        (ValueRef::Null, _) => Json::Null,
        (ValueRef::Integer(i), SerKind::IntAsString) => Json::String(i.to_string()),
        (ValueRef::Integer(i), _) => Json::from(i),
        (ValueRef::Real(f), _) => Json::from(f),
        (ValueRef::Text(t), _) => Json::String(String::from_utf8_lossy(t).into_owned()),
        (ValueRef::Blob(b), _) => Json::String(String::from_utf8_lossy(b).into_owned()),
    }
}

fn json_to_rusqlite(v: &Json) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match v {
        Json::Null => SqlValue::Null,
        Json::Bool(b) => SqlValue::Integer(*b as i64),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => {
            // A string-serialized integer column (IntAsString) round-trips
            // back to an integer; anything else stays text.
            if let Ok(i) = s.parse::<i64>() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Text(s.clone())
            }
        }
        other => SqlValue::Text(other.to_string()),
    }
}

/// Apply incoming rows to `table`, upserting by primary key and
/// resolving conflicts by `mod` timestamp (receiver wins on a tie).
/// Any row whose `usn` is [`Usn::NEW`] is reassigned `next_usn` before
/// being written, and `next_usn` is returned incremented past every
/// freshly assigned value.
///
/// `Config` is a singleton blob with no USN of its own: the incoming
/// row, if any, simply replaces the receiver's current value via
/// [`write_config`], and `next_usn` passes through unchanged.
#[instrument(skip(handle, rows))]
pub fn apply_changes(
    handle: &CollectionHandle,
    table: TableId,
    mut rows: Vec<Row>,
    mut next_usn: Usn,
) -> Result<Usn> {
    if table == TableId::Config {
        if let Some(value) = rows.into_iter().next().and_then(|row| row.into_iter().next()) {
            write_config(handle, &value)?;
        }
        return Ok(next_usn);
    }

    let cols = columns_for(table);
    let usn_idx = usn_column_index(table);
    let mod_idx = mod_column_index(table);
    let pk_idx = primary_key_index(table);

    handle.with_conn_mut(|conn| {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Internal(format!("failed to start transaction: {e}")))?;

        for row in rows.iter_mut() {
            let incoming_usn = row[usn_idx].as_i64().unwrap_or(-1);
            if incoming_usn < 0 {
                row[usn_idx] = Json::from(next_usn.0);
                next_usn = next_usn.next();
            }

            if let Some(pk_idx) = pk_idx {
                if let Some(existing_mod) = fetch_existing_mod(&tx, table, mod_idx, pk_idx, &row[pk_idx])? {
                    if let Some(mod_idx) = mod_idx {
                        let incoming_mod = row[mod_idx].as_i64().unwrap_or(0);
                        if incoming_mod <= existing_mod {
                            // Receiver's row is newer, or tied; the
                            // receiver wins a tie, so keep it either way.
                            continue;
                        }
                    }
                }
            }

            upsert_row(&tx, table, cols, &row, pk_idx)?;
        }

        tx.commit()
            .map_err(|e| Error::Internal(format!("failed to commit apply_changes: {e}")))?;
        Ok(())
    })?;

    Ok(next_usn)
}

fn fetch_existing_mod(
    conn: &Connection,
    table: TableId,
    mod_idx: Option<usize>,
    pk_idx: usize,
    pk_value: &Json,
) -> Result<Option<i64>> {
    let Some(mod_idx) = mod_idx else {
        return Ok(None);
    };
    let cols = columns_for(table);
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        cols[mod_idx].name,
        table.as_str(),
        cols[pk_idx].name
    );
    let value = json_to_rusqlite(pk_value);
    conn.query_row(&sql, [value], |row| row.get::<_, i64>(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(Error::Internal(format!("failed to read existing row: {other}"))),
        })
}

fn upsert_row(
    conn: &Connection,
    table: TableId,
    cols: &[crate::schema::ColumnSpec],
    row: &[Json],
    pk_idx: Option<usize>,
) -> Result<()> {
    let col_list = cols.iter().map(|c| c.name).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=cols.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if let Some(pk_idx) = pk_idx {
        let conflict_col = cols[pk_idx].name;
        let assignments = cols
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pk_idx)
            .map(|(_, c)| format!("{} = excluded.{}", c.name, c.name))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({col_list}) VALUES ({placeholders}) \
             ON CONFLICT({conflict_col}) DO UPDATE SET {assignments}",
            table.as_str(),
        )
    } else {
        format!("INSERT OR REPLACE INTO {} ({col_list}) VALUES ({placeholders})", table.as_str())
    };

    let values = row.iter().map(json_to_rusqlite).collect::<Vec<_>>();
    conn.execute(&sql, params_from_iter(values))
        .map_err(|e| Error::Internal(format!("failed to upsert row in {}: {e}", table.as_str())))?;
    Ok(())
}

/// List graves with `usn` strictly greater than `since`, across every
/// table kind.
#[instrument(skip(handle))]
pub fn list_graves(handle: &CollectionHandle, since: Usn) -> Result<Vec<Grave>> {
    handle.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT kind, id, usn FROM graves WHERE usn > ?1 ORDER BY usn ASC")
            .map_err(|e| Error::Internal(format!("failed to prepare grave query: {e}")))?;
        let rows = stmt
            .query_map([since.0], |row| {
                Ok(Grave {
                    kind: row.get(0)?,
                    id: row.get::<_, i64>(1)?.to_string(),
                    usn: row.get(2)?,
                })
            })
            .map_err(|e| Error::Internal(format!("failed to list graves: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| Error::Internal(format!("failed to read grave: {e}")))?);
        }
        Ok(out)
    })
}

/// Apply incoming graves, always before any row upserts in the same
/// transaction, so a tombstoned object cannot be resurrected by a
/// concurrently streamed row.
#[instrument(skip(handle, graves))]
pub fn apply_graves(handle: &CollectionHandle, graves: &[Grave], mut next_usn: Usn) -> Result<Usn> {
    handle.with_conn_mut(|conn| {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Internal(format!("failed to start grave transaction: {e}")))?;
        for grave in graves {
            let id: i64 = grave
                .id
                .parse()
                .map_err(|_| Error::BadRequest(format!("grave id {} is not an integer", grave.id)))?;
            tx.execute(
                "INSERT INTO graves (kind, id, usn) VALUES (?1, ?2, ?3)",
                rusqlite::params![grave.kind, id, next_usn.0],
            )
            .map_err(|e| Error::Internal(format!("failed to insert grave: {e}")))?;
            delete_object(&tx, &grave.kind, id)?;
            next_usn = next_usn.next();
        }
        tx.commit()
            .map_err(|e| Error::Internal(format!("failed to commit graves: {e}")))?;
        Ok(())
    })?;
    Ok(next_usn)
}

fn delete_object(conn: &Connection, kind: &str, id: i64) -> Result<()> {
    let table = match kind {
        "card" => "cards",
        "note" => "notes",
        "deck" => "decks",
        other => return Err(Error::BadRequest(format!("unknown grave kind {other}"))),
    };
    conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])
        .map_err(|e| Error::Internal(format!("failed to delete graved object: {e}")))?;
    Ok(())
}

/// Read the collection's config blob, or `Json::Null` if no config row
/// has been written yet.
pub fn read_config(handle: &CollectionHandle) -> Result<Json> {
    handle.with_conn(|conn| {
        let raw: Option<String> = conn
            .query_row("SELECT val FROM config WHERE key = 'conf'", [], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::Internal(format!("failed to read config: {other}"))),
            })?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map_err(Error::from),
            None => Ok(Json::Null),
        }
    })
}

/// Write the collection's config blob.
pub fn write_config(handle: &CollectionHandle, value: &Json) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    handle.with_conn_mut(|conn| {
        conn.execute(
            "INSERT INTO config (key, val) VALUES ('conf', ?1) \
             ON CONFLICT(key) DO UPDATE SET val = excluded.val",
            [raw],
        )
        .map_err(|e| Error::Internal(format!("failed to write config: {e}")))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> CollectionHandle {
        let handle = CollectionHandle::open_in_memory().unwrap();
        handle
            .with_conn_mut(|conn| {
                conn.execute_batch(
                    "CREATE TABLE decks (id INTEGER PRIMARY KEY, name TEXT, mod INTEGER, usn INTEGER, common TEXT, kind TEXT);
                     CREATE TABLE graves (kind TEXT, id INTEGER, usn INTEGER);
                     CREATE TABLE cards (id INTEGER PRIMARY KEY, nid INTEGER);
                     CREATE TABLE notes (id INTEGER PRIMARY KEY, csum INTEGER);
                     CREATE TABLE config (key TEXT PRIMARY KEY, val TEXT);",
                )
                .unwrap();
                Ok(())
            })
            .unwrap();
        handle
    }

    #[test]
    fn new_row_gets_assigned_next_usn() {
        let handle = setup();
        let row: Row = vec![
            Json::from(1),
            Json::String("Default".into()),
            Json::from(1000),
            Json::from(-1),
            Json::String("{}".into()),
            Json::String("normal".into()),
        ];
        let next = apply_changes(&handle, TableId::Decks, vec![row], Usn(5)).unwrap();
        assert_eq!(next, Usn(6));

        let changes = enumerate_changes(&handle, Usn(0)).unwrap();
        let deck_rows = changes
            .iter()
            .find(|(t, _)| *t == TableId::Decks)
            .map(|(_, rows)| rows.clone())
            .unwrap();
        assert_eq!(deck_rows.len(), 1);
        assert_eq!(deck_rows[0][3], Json::from(5));
    }

    #[test]
    fn later_mod_wins_on_conflict() {
        let handle = setup();
        let first: Row = vec![
            Json::from(1),
            Json::String("Default".into()),
            Json::from(1000),
            Json::from(0),
            Json::String("{}".into()),
            Json::String("normal".into()),
        ];
        apply_changes(&handle, TableId::Decks, vec![first], Usn(1)).unwrap();

        let stale: Row = vec![
            Json::from(1),
            Json::String("Stale".into()),
            Json::from(500),
            Json::from(-1),
            Json::String("{}".into()),
            Json::String("normal".into()),
        ];
        apply_changes(&handle, TableId::Decks, vec![stale], Usn(2)).unwrap();

        let changes = enumerate_changes(&handle, Usn(0)).unwrap();
        let name = changes
            .iter()
            .find(|(t, _)| *t == TableId::Decks)
            .map(|(_, rows)| rows[0][1].clone())
            .unwrap();
        assert_eq!(name, Json::String("Default".into()));
    }

    #[test]
    fn grave_checksum_column_round_trips_as_string() {
        let handle = setup();
        handle
            .with_conn_mut(|conn| {
                conn.execute("INSERT INTO notes (id, csum) VALUES (1, 123456789)", [])
                    .unwrap();
                Ok(())
            })
            .unwrap();
        // csum has no usn column in this minimal test table, so exercise
        // value_to_json indirectly through the schema descriptor instead.
        let cols = columns_for(TableId::Notes);
        let csum_idx = cols.iter().position(|c| c.name == "csum").unwrap();
        assert_eq!(cols[csum_idx].kind, SerKind::IntAsString);
    }

    #[test]
    fn applying_a_grave_prevents_resurrection() {
        let handle = setup();
        handle
            .with_conn_mut(|conn| {
                conn.execute("INSERT INTO cards (id, nid) VALUES (7, 1)", [])
                    .unwrap();
                Ok(())
            })
            .unwrap();

        let grave = Grave {
            kind: "card".into(),
            id: "7".into(),
            usn: 0,
        };
        apply_graves(&handle, &[grave], Usn(10)).unwrap();

        let count: i64 = handle
            .with_conn(|conn| Ok(conn.query_row("SELECT count(*) FROM cards WHERE id = 7", [], |r| r.get(0)).unwrap()))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn config_round_trips() {
        let handle = setup();
        let value = serde_json::json!({"curDeck": 1});
        write_config(&handle, &value).unwrap();
        let read_back = read_config(&handle).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn enumerate_changes_includes_the_config_blob() {
        let handle = setup();
        let value = serde_json::json!({"curDeck": 2});
        write_config(&handle, &value).unwrap();

        let changes = enumerate_changes(&handle, Usn(0)).unwrap();
        let config_rows = changes
            .iter()
            .find(|(t, _)| *t == TableId::Config)
            .map(|(_, rows)| rows.clone())
            .unwrap();
        assert_eq!(config_rows, vec![vec![value]]);
    }

    #[test]
    fn apply_changes_writes_the_config_blob_and_consumes_no_usn() {
        let handle = setup();
        let value = serde_json::json!({"curDeck": 3});
        let next = apply_changes(&handle, TableId::Config, vec![vec![value.clone()]], Usn(5)).unwrap();
        assert_eq!(next, Usn(5));
        assert_eq!(read_config(&handle).unwrap(), value);
    }
}
