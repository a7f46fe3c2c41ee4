use relay_core::state::StateMap;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a state column, which must hold a JSON object.
pub fn parse_state(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<StateMap, StoreError> {
    match parse_json::<serde_json::Value>(raw, table, column)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(StoreError::CorruptRow {
            table,
            column,
            detail: format!("expected object, found {other}"),
        }),
    }
}
