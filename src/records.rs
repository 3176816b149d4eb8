//! JSON-lines city object records and the import/export collaborators built
//! on them.
//!
//! One line holds one top-level object:
//!
//! ```json
//! {"id":"b1","type":"Building","bbox":[13.1,52.4,13.2,52.5],"srid":4326,
//!  "parent":"site-1","assets":["tex/roof.png"],"attributes":{"height":12.5}}
//! ```

use crate::db::{DatabaseAdapter, SRID_WGS84};
use crate::error::PipelineError;
use crate::models::{CacheEntry, Envelope, TypeTag, WorkUnit};
use crate::pipeline::{UnitIter, WorkSource};
use crate::worker::{UnitContext, UnitTransformer};
use crate::xlink::{DeferredReference, ReferenceKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows fetched per query by [`CityObjectSource`].
const EXPORT_PAGE: i64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// `[min_x, min_y, max_x, max_y]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Objects this appearance applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appearance_targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geometries: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl FeatureRecord {
    pub fn envelope(&self) -> Option<Envelope> {
        self.bbox.map(|[min_x, min_y, max_x, max_y]| {
            Envelope::new(min_x, min_y, max_x, max_y, self.srid.unwrap_or(SRID_WGS84))
        })
    }
}

/// Restartable source over a JSON-lines file.
///
/// Blank lines are ignored. Lines that fail to decode are reported as errors
/// and do not consume a sequence number.
pub struct JsonLinesSource {
    path: PathBuf,
    first_sequence: u64,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            first_sequence: 0,
        }
    }

    pub fn with_first_sequence(mut self, first_sequence: u64) -> Self {
        self.first_sequence = first_sequence;
        self
    }
}

impl WorkSource for JsonLinesSource {
    type Payload = FeatureRecord;

    fn units(&mut self) -> Result<UnitIter<'_, FeatureRecord>, PipelineError> {
        let file = File::open(&self.path)?;
        Ok(Box::new(RecordLines {
            lines: BufReader::new(file).lines(),
            line: 0,
            next_sequence: self.first_sequence,
        }))
    }
}

struct RecordLines<R> {
    lines: Lines<R>,
    line: u64,
    next_sequence: u64,
}

impl<R: BufRead> Iterator for RecordLines<R> {
    type Item = Result<WorkUnit<FeatureRecord>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return Some(self.decode(&text));
        }
    }
}

impl<R> RecordLines<R> {
    fn decode(&mut self, text: &str) -> Result<WorkUnit<FeatureRecord>, PipelineError> {
        let record: FeatureRecord = serde_json::from_str(text).map_err(|source| PipelineError::Decode {
            line: self.line,
            source,
        })?;
        let type_tag: TypeTag = record.type_name.parse().map_err(|reason| PipelineError::Malformed {
            external_id: record.id.clone(),
            type_tag: record.type_name.clone(),
            reason,
        })?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(WorkUnit {
            external_id: record.id.clone(),
            type_tag,
            envelope: record.envelope(),
            sequence,
            payload: record,
        })
    }
}

/// What the import direction reports per stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedObject {
    pub id: String,
    pub row_id: i64,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Stores records as `city_object` rows.
///
/// Parents already known to the identifier cache are linked inline; unknown
/// parents, shared appearance targets and external assets are deferred. A
/// record whose id is already stored is removed again and yields no output.
///
/// Among records sharing an id, the one whose worker reaches the identifier
/// cache first is kept. That is the earlier record only with a single worker;
/// with several, input order does not decide.
#[derive(Debug, Default)]
pub struct RecordImporter {
    inserted: u64,
    duplicates: u64,
}

impl RecordImporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnitTransformer for RecordImporter {
    type Payload = FeatureRecord;
    type Output = ImportedObject;

    fn transform(
        &mut self,
        unit: &WorkUnit<FeatureRecord>,
        cx: &mut UnitContext<'_>,
    ) -> Result<Option<ImportedObject>, PipelineError> {
        let record = &unit.payload;
        let conn = cx.connection();
        let db_err = |e: rusqlite::Error| PipelineError::database(format!("store {}", unit.external_id), e);

        // Resolve the parent before writing: no write may be pending on this
        // connection while the identifier cache is consulted.
        let parent = match &record.parent {
            Some(parent) => cx.ids().lookup(parent)?,
            None => None,
        };
        let [min_x, min_y, max_x, max_y] = match record.bbox {
            Some(b) => b.map(Some),
            None => [None; 4],
        };
        conn.prepare_cached(
            "INSERT INTO city_object \
             (gmlid, type_tag, parent_id, min_x, min_y, max_x, max_y, srid, attributes, geometry) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .and_then(|mut stmt| {
            stmt.execute(params![
                unit.external_id,
                unit.type_tag.code(),
                parent.as_ref().map(|p| p.internal_id),
                min_x,
                min_y,
                max_x,
                max_y,
                record.bbox.map(|_| record.srid.unwrap_or(SRID_WGS84)),
                json_column(&record.attributes)?,
                json_column(&record.geometries)?,
            ])
        })
        .map_err(db_err)?;
        let row_id = conn.last_insert_rowid();
        let root_id = parent.as_ref().map_or(row_id, |p| p.root_id);
        conn.prepare_cached("UPDATE city_object SET root_id = ?1 WHERE id = ?2")
            .and_then(|mut stmt| stmt.execute(params![root_id, row_id]))
            .map_err(db_err)?;

        let entry = CacheEntry::new(unit.external_id.clone(), row_id, unit.type_tag).with_root(root_id);
        if !cx.ids().put(entry)? {
            warn!(external_id = %unit.external_id, "Skipping duplicate object id");
            conn.prepare_cached("DELETE FROM city_object WHERE id = ?1")
                .and_then(|mut stmt| stmt.execute(params![row_id]))
                .map_err(db_err)?;
            self.duplicates += 1;
            return Ok(None);
        }

        let mut references = Vec::new();
        if let (Some(target), None) = (&record.parent, &parent) {
            references.push(DeferredReference::new(ReferenceKind::ParentLink, row_id, target.clone()));
        }
        for target in &record.appearance_targets {
            references.push(DeferredReference::new(ReferenceKind::SharedAppearance, row_id, target.clone()));
        }
        for uri in &record.assets {
            references.push(DeferredReference::new(ReferenceKind::ExternalAsset, row_id, uri.clone()));
        }
        if let Err(e) = cx.defer_all(references) {
            // Nothing was queued; take the object back out so the tombstone
            // leaves no half-imported row behind.
            cx.ids().remove(&unit.external_id)?;
            conn.prepare_cached("DELETE FROM city_object WHERE id = ?1")
                .and_then(|mut stmt| stmt.execute(params![row_id]))
                .map_err(db_err)?;
            return Err(e);
        }
        self.inserted += 1;
        cx.add_geometries(record.geometries.len() as u64);

        Ok(Some(ImportedObject {
            id: unit.external_id.clone(),
            row_id,
            type_name: unit.type_tag.name().to_string(),
        }))
    }

    fn finish(&mut self, _conn: &Connection) -> Result<(), PipelineError> {
        debug!(inserted = self.inserted, duplicates = self.duplicates, "Importer finished");
        Ok(())
    }
}

/// Serializes a JSON column value, storing empty collections as NULL.
fn json_column<T: Serialize>(value: &T) -> rusqlite::Result<Option<String>> {
    let text = serde_json::to_string(value)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(match text.as_str() {
        "{}" | "[]" | "null" => None,
        _ => Some(text),
    })
}

/// Row payload handed to [`RecordExporter`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub row_id: i64,
    pub root_id: Option<i64>,
    pub parent_id: Option<i64>,
    /// Type code of the parent row, `None` when the parent row is missing
    pub parent_type: Option<i64>,
    pub srid: Option<u32>,
    pub attributes: Option<String>,
    pub geometry: Option<String>,
}

/// Restartable source over stored `city_object` rows, in row id order.
pub struct CityObjectSource {
    adapter: Arc<dyn DatabaseAdapter>,
    type_filter: Option<TypeTag>,
    first_sequence: u64,
    conn: Option<Connection>,
}

impl CityObjectSource {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            type_filter: None,
            first_sequence: 0,
            conn: None,
        }
    }

    pub fn with_type(mut self, type_tag: Option<TypeTag>) -> Self {
        self.type_filter = type_tag;
        self
    }

    pub fn with_first_sequence(mut self, first_sequence: u64) -> Self {
        self.first_sequence = first_sequence;
        self
    }
}

impl WorkSource for CityObjectSource {
    type Payload = StoredObject;

    fn units(&mut self) -> Result<UnitIter<'_, StoredObject>, PipelineError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.adapter.connect()?,
        };
        let conn = self.conn.insert(conn);
        Ok(Box::new(StoredRows {
            conn,
            type_filter: self.type_filter.map(TypeTag::code),
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            next_sequence: self.first_sequence,
        }))
    }
}

struct RawRow {
    gmlid: String,
    type_code: i64,
    bbox: [Option<f64>; 4],
    object: StoredObject,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let srid: Option<i64> = row.get(10)?;
        Ok(Self {
            gmlid: row.get(1)?,
            type_code: row.get(2)?,
            bbox: [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
            object: StoredObject {
                row_id: row.get(0)?,
                parent_id: row.get(3)?,
                parent_type: row.get(4)?,
                root_id: row.get(5)?,
                srid: srid.and_then(|s| u32::try_from(s).ok()),
                attributes: row.get(11)?,
                geometry: row.get(12)?,
            },
        })
    }
}

struct StoredRows<'a> {
    conn: &'a Connection,
    type_filter: Option<i64>,
    after: i64,
    buffer: VecDeque<RawRow>,
    exhausted: bool,
    next_sequence: u64,
}

impl StoredRows<'_> {
    fn fetch_page(&mut self) -> Result<(), PipelineError> {
        let conn = self.conn;
        let mut stmt = conn
            .prepare_cached(
                "SELECT c.id, c.gmlid, c.type_tag, c.parent_id, p.type_tag, c.root_id, \
                        c.min_x, c.min_y, c.max_x, c.max_y, c.srid, c.attributes, c.geometry \
                 FROM city_object c LEFT JOIN city_object p ON p.id = c.parent_id \
                 WHERE c.id > ?1 AND (?2 IS NULL OR c.type_tag = ?2) \
                 ORDER BY c.id LIMIT ?3",
            )
            .map_err(|e| PipelineError::database("read city objects", e))?;
        let rows = stmt
            .query_map(params![self.after, self.type_filter, EXPORT_PAGE], RawRow::from_row)
            .map_err(|e| PipelineError::database("read city objects", e))?;
        let before = self.buffer.len();
        for row in rows {
            self.buffer
                .push_back(row.map_err(|e| PipelineError::database("read city objects", e))?);
        }
        let fetched = self.buffer.len() - before;
        if let Some(last) = self.buffer.back() {
            self.after = last.object.row_id;
        }
        if fetched < EXPORT_PAGE as usize {
            self.exhausted = true;
        }
        Ok(())
    }

    fn to_unit(&mut self, raw: RawRow) -> Result<WorkUnit<StoredObject>, PipelineError> {
        let type_tag = TypeTag::from_code(raw.type_code).ok_or_else(|| PipelineError::Malformed {
            external_id: raw.gmlid.clone(),
            type_tag: raw.type_code.to_string(),
            reason: "unknown type code".to_string(),
        })?;
        let envelope = match raw.bbox {
            [Some(min_x), Some(min_y), Some(max_x), Some(max_y)] => Some(Envelope::new(
                min_x,
                min_y,
                max_x,
                max_y,
                raw.object.srid.unwrap_or(SRID_WGS84),
            )),
            _ => None,
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(WorkUnit {
            external_id: raw.gmlid,
            type_tag,
            envelope,
            sequence,
            payload: raw.object,
        })
    }
}

impl Iterator for StoredRows<'_> {
    type Item = Result<WorkUnit<StoredObject>, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let raw = self.buffer.pop_front()?;
        Some(self.to_unit(raw))
    }
}

/// Rebuilds records from stored rows.
///
/// Parent row ids are mapped back to external ids through the identifier
/// cache, falling back to the database for parents another worker has not
/// reached yet.
#[derive(Debug, Default)]
pub struct RecordExporter;

impl RecordExporter {
    pub fn new() -> Self {
        Self
    }

    fn parent_id(
        &self,
        cx: &UnitContext<'_>,
        unit: &WorkUnit<StoredObject>,
    ) -> Result<Option<String>, PipelineError> {
        let object = &unit.payload;
        let Some(parent_id) = object.parent_id else {
            return Ok(None);
        };
        let malformed = |reason: String| PipelineError::Malformed {
            external_id: unit.external_id.clone(),
            type_tag: unit.type_tag.to_string(),
            reason,
        };
        let parent_type = object
            .parent_type
            .and_then(TypeTag::from_code)
            .ok_or_else(|| malformed(format!("parent row {parent_id} is missing")))?;
        if let Some(external_id) = cx.ids().lookup_by_internal_id(parent_id, parent_type)? {
            return Ok(Some(external_id));
        }
        let found: Option<String> = cx
            .connection()
            .prepare_cached("SELECT gmlid FROM city_object WHERE id = ?1")
            .and_then(|mut stmt| stmt.query_row(params![parent_id], |row| row.get(0)).optional())
            .map_err(|e| PipelineError::database("read parent object", e))?;
        found
            .map(Some)
            .ok_or_else(|| malformed(format!("parent row {parent_id} is missing")))
    }
}

impl UnitTransformer for RecordExporter {
    type Payload = StoredObject;
    type Output = FeatureRecord;

    fn transform(
        &mut self,
        unit: &WorkUnit<StoredObject>,
        cx: &mut UnitContext<'_>,
    ) -> Result<Option<FeatureRecord>, PipelineError> {
        let object = &unit.payload;
        let entry = CacheEntry::new(unit.external_id.clone(), object.row_id, unit.type_tag)
            .with_root(object.root_id.unwrap_or(object.row_id));
        cx.ids().put(entry)?;

        let malformed = |reason: String| PipelineError::Malformed {
            external_id: unit.external_id.clone(),
            type_tag: unit.type_tag.to_string(),
            reason,
        };
        let attributes: Map<String, Value> = match &object.attributes {
            Some(text) => serde_json::from_str(text).map_err(|e| malformed(format!("attributes: {e}")))?,
            None => Map::new(),
        };
        let geometries: Vec<Value> = match &object.geometry {
            Some(text) => serde_json::from_str(text).map_err(|e| malformed(format!("geometry: {e}")))?,
            None => Vec::new(),
        };
        cx.add_geometries(geometries.len() as u64);

        let parent = self.parent_id(cx, unit)?;
        let conn = cx.connection();
        let assets = strings(
            conn,
            "SELECT uri FROM external_asset WHERE owner_id = ?1 ORDER BY uri",
            object.row_id,
        )?;
        let appearance_targets = strings(
            conn,
            "SELECT o.gmlid FROM appearance_target a JOIN city_object o ON o.id = a.target_id \
             WHERE a.appearance_id = ?1 ORDER BY o.gmlid",
            object.row_id,
        )?;

        Ok(Some(FeatureRecord {
            id: unit.external_id.clone(),
            type_name: unit.type_tag.name().to_string(),
            bbox: unit.envelope.map(|e| e.bounds()),
            srid: unit.envelope.map(|e| e.srid),
            parent,
            appearance_targets,
            assets,
            geometries,
            attributes,
        }))
    }
}

fn strings(conn: &Connection, sql: &str, id: i64) -> Result<Vec<String>, PipelineError> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| PipelineError::database("read related rows", e))?;
    let rows = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))
        .map_err(|e| PipelineError::database("read related rows", e))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| PipelineError::database("read related rows", e))
}
