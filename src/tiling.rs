//! Spatial tiling: restricts a run to the units whose envelope midpoint falls
//! inside one tile of a regular grid.

use crate::db::DatabaseAdapter;
use crate::error::PipelineError;
use crate::models::Envelope;
use geo::{coord, Coord, Rect};
use serde::{Deserialize, Serialize};

/// Regular grid over `extent`, with one active tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// `[min_x, min_y, max_x, max_y]` in `srid`
    pub extent: [f64; 4],
    pub srid: u32,
    pub rows: u32,
    pub columns: u32,
    #[serde(default)]
    pub row: u32,
    #[serde(default)]
    pub column: u32,
}

impl TilingConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let [min_x, min_y, max_x, max_y] = self.extent;
        if self.extent.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Config(
                "tiling extent must be finite".to_string(),
            ));
        }
        if min_x >= max_x || min_y >= max_y {
            return Err(PipelineError::Config(format!(
                "tiling extent {:?} is empty",
                self.extent
            )));
        }
        if self.rows == 0 || self.columns == 0 {
            return Err(PipelineError::Config(
                "tiling needs at least one row and one column".to_string(),
            ));
        }
        if self.row >= self.rows || self.column >= self.columns {
            return Err(PipelineError::Config(format!(
                "active tile ({}, {}) outside {}x{} grid",
                self.row, self.column, self.rows, self.columns
            )));
        }
        Ok(())
    }

    /// Bounds of the active tile. Row 0 is the southernmost row.
    pub fn active_tile(&self) -> Tile {
        let [min_x, min_y, max_x, max_y] = self.extent;
        let width = (max_x - min_x) / f64::from(self.columns);
        let height = (max_y - min_y) / f64::from(self.rows);
        let x0 = min_x + width * f64::from(self.column);
        let y0 = min_y + height * f64::from(self.row);
        let last_column = self.column + 1 == self.columns;
        let last_row = self.row + 1 == self.rows;
        Tile {
            rect: Rect::new(
                coord! { x: x0, y: y0 },
                coord! {
                    x: if last_column { max_x } else { x0 + width },
                    y: if last_row { max_y } else { y0 + height },
                },
            ),
            srid: self.srid,
            closed_x: last_column,
            closed_y: last_row,
        }
    }
}

/// One grid cell.
///
/// Cells are half-open so a point on a shared edge belongs to exactly one
/// tile. The outermost edges of the extent are closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    pub rect: Rect<f64>,
    pub srid: u32,
    closed_x: bool,
    closed_y: bool,
}

impl Tile {
    pub fn contains(&self, p: Coord<f64>) -> bool {
        let min = self.rect.min();
        let max = self.rect.max();
        let in_x = p.x >= min.x && (p.x < max.x || (self.closed_x && p.x == max.x));
        let in_y = p.y >= min.y && (p.y < max.y || (self.closed_y && p.y == max.y));
        in_x && in_y
    }
}

/// Cheap pre-check run by workers before a unit is materialized.
#[derive(Debug, Clone, Copy)]
pub struct TileFilter {
    tile: Tile,
}

impl TileFilter {
    pub fn new(config: &TilingConfig) -> Self {
        Self {
            tile: config.active_tile(),
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Whether a unit with this envelope belongs to the active tile.
    ///
    /// Units without an envelope never do. The envelope is converted into the
    /// tile's spatial reference first.
    pub fn admits(
        &self,
        envelope: Option<&Envelope>,
        adapter: &dyn DatabaseAdapter,
    ) -> Result<bool, PipelineError> {
        let Some(envelope) = envelope else {
            return Ok(false);
        };
        let envelope = adapter.transform_envelope(envelope, self.tile.srid)?;
        Ok(self.tile.contains(envelope.midpoint()))
    }
}
