//! Database adapter seam and the SQLite implementation used by the pipeline.
//!
//! Every worker opens its own connection through [`DatabaseAdapter::connect`]
//! and keeps it for its whole lifetime; connections are never shared between
//! threads.

use crate::cache_table::CacheTableModel;
use crate::error::PipelineError;
use crate::models::Envelope;
use rusqlite::{Connection, Statement};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// WGS 84 geographic coordinates
pub const SRID_WGS84: u32 = 4326;

/// Web Mercator projected coordinates
pub const SRID_WEB_MERCATOR: u32 = 3857;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude limit of the Web Mercator projection
const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

pub trait DatabaseAdapter: Send + Sync {
    fn connect(&self) -> Result<Connection, PipelineError>;

    /// Largest number of rows written per transaction.
    fn max_batch_size(&self) -> usize;

    fn transform_envelope(
        &self,
        envelope: &Envelope,
        target_srid: u32,
    ) -> Result<Envelope, PipelineError>;

    fn create_table(
        &self,
        conn: &Connection,
        name: &str,
        model: CacheTableModel,
        indexed: bool,
    ) -> Result<(), PipelineError> {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" ({});",
            model.columns()
        );
        if indexed {
            for (i, column) in model.index_columns().iter().enumerate() {
                ddl.push_str(&format!(
                    "CREATE INDEX IF NOT EXISTS \"{name}_idx{i}\" ON \"{name}\" ({column});"
                ));
            }
        }
        conn.execute_batch(&ddl)
            .map_err(|e| PipelineError::database(format!("create table {name}"), e))
    }

    fn drop_table(&self, conn: &Connection, name: &str) -> Result<(), PipelineError> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\";"))
            .map_err(|e| PipelineError::database(format!("drop table {name}"), e))
    }
}

/// File-backed SQLite database in WAL mode.
#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    path: PathBuf,
    max_batch_size: usize,
    busy_timeout: Duration,
}

impl SqliteAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_batch_size: crate::config::MAX_BATCH_SIZE,
            busy_timeout: Duration::from_millis(crate::config::BUSY_TIMEOUT_MS),
        }
    }

    pub fn with_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn connect(&self) -> Result<Connection, PipelineError> {
        let connect_err = |source| PipelineError::Connect {
            path: self.path.clone(),
            source,
        };
        let conn = Connection::open(&self.path).map_err(connect_err)?;
        conn.busy_timeout(self.busy_timeout).map_err(connect_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(connect_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(connect_err)?;
        debug!(path = ?self.path, "Opened database connection");
        Ok(conn)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn transform_envelope(
        &self,
        envelope: &Envelope,
        target_srid: u32,
    ) -> Result<Envelope, PipelineError> {
        if envelope.srid == target_srid {
            return Ok(*envelope);
        }
        let [min_x, min_y, max_x, max_y] = envelope.bounds();
        let project: fn(f64, f64) -> (f64, f64) = match (envelope.srid, target_srid) {
            (SRID_WGS84, SRID_WEB_MERCATOR) => wgs84_to_mercator,
            (SRID_WEB_MERCATOR, SRID_WGS84) => mercator_to_wgs84,
            (from, to) => return Err(PipelineError::UnsupportedSrs { from, to }),
        };
        // Both projections are monotonic per axis, so corners map to corners.
        let (x0, y0) = project(min_x, min_y);
        let (x1, y1) = project(max_x, max_y);
        Ok(Envelope::new(x0, y0, x1, y1, target_srid))
    }
}

fn wgs84_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let x = EARTH_RADIUS_M * lon.to_radians();
    let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

fn mercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

/// Executes `sql` once per row, committing every `batch_size` rows.
///
/// Returns the number of rows written.
pub fn execute_in_batches<T, F>(
    conn: &Connection,
    sql: &str,
    rows: &[T],
    batch_size: usize,
    mut bind: F,
) -> Result<usize, PipelineError>
where
    F: FnMut(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
{
    let mut written = 0;
    for chunk in rows.chunks(batch_size.max(1)) {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| PipelineError::database("begin batch", e))?;
        {
            let mut stmt = tx
                .prepare_cached(sql)
                .map_err(|e| PipelineError::database("prepare batch statement", e))?;
            for row in chunk {
                bind(&mut *stmt, row)
                    .map_err(|e| PipelineError::database("execute batch statement", e))?;
                written += 1;
            }
        }
        tx.commit()
            .map_err(|e| PipelineError::database("commit batch", e))?;
    }
    Ok(written)
}
