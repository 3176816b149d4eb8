//! Minimal target tables written by the import direction and read by export.

use crate::error::PipelineError;
use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS city_object (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gmlid TEXT NOT NULL,
    type_tag INTEGER NOT NULL,
    parent_id INTEGER,
    root_id INTEGER,
    min_x REAL,
    min_y REAL,
    max_x REAL,
    max_y REAL,
    srid INTEGER,
    attributes TEXT,
    geometry TEXT
);
CREATE INDEX IF NOT EXISTS city_object_gmlid ON city_object (gmlid);
CREATE INDEX IF NOT EXISTS city_object_parent ON city_object (parent_id);

CREATE TABLE IF NOT EXISTS external_asset (
    uri TEXT PRIMARY KEY,
    owner_id INTEGER NOT NULL,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS appearance_target (
    appearance_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    PRIMARY KEY (appearance_id, target_id)
);
";

/// Creates the target tables if they do not exist yet.
pub fn ensure_schema(conn: &Connection) -> Result<(), PipelineError> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| PipelineError::database("create target schema", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["appearance_target", "city_object", "external_asset"]);
    }
}
