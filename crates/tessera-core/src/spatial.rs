//! Spatial grid extension.
//!
//! A `width x height` lattice with one patch entity per cell. Patches are
//! ordinary entities of the `patch` primitive, created row-major at setup;
//! the grid only maps cells to patch ids and tracks which other entities
//! stand on each cell. Neighbor relations are computed on demand and are
//! lookups only.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tessera_types::{EntityId, Neighborhood, Position};

/// Primitive name of grid patches.
pub const PATCH_PRIMITIVE: &str = "patch";

/// Stepping priority of patches: after default-priority primitives.
pub const PATCH_PRIORITY: i32 = -1;

/// Errors raised by grid operations.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// Zero-sized or overflowing dimensions.
    #[error("invalid grid dimensions {width}x{height}")]
    InvalidDimensions {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },

    /// The position lies outside the grid.
    #[error("position {0} is outside the grid")]
    OutOfBounds(Position),

    /// The grid is already enabled.
    #[error("grid already enabled")]
    AlreadyEnabled,

    /// The grid can only be enabled before setup.
    #[error("grid must be enabled before setup")]
    TooLate,

    /// No grid is enabled.
    #[error("grid not enabled")]
    NotEnabled,

    /// The entity is not placed on the grid.
    #[error("entity {0} has no position")]
    Unplaced(EntityId),

    /// Patches are fixed to their cell.
    #[error("entity {0} is a patch and cannot move")]
    PatchImmovable(EntityId),
}

/// Grid shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of columns.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
    /// Neighbor relation.
    #[serde(default)]
    pub neighborhood: Neighborhood,
    /// Whether edges wrap around (torus).
    #[serde(default)]
    pub wrap: bool,
}

/// Cell-to-patch map plus occupant index.
#[derive(Debug, Clone)]
pub struct Grid {
    config: GridConfig,
    cells: Vec<Option<EntityId>>,
    occupants: BTreeMap<Position, BTreeSet<EntityId>>,
}

impl Grid {
    /// Create an empty grid.
    pub fn new(config: GridConfig) -> Result<Self, SpatialError> {
        let cells = usize::try_from(u64::from(config.width).saturating_mul(u64::from(config.height)))
            .ok()
            .filter(|n| *n > 0)
            .ok_or(SpatialError::InvalidDimensions {
                width: config.width,
                height: config.height,
            })?;
        Ok(Self {
            config,
            cells: vec![None; cells],
            occupants: BTreeMap::new(),
        })
    }

    /// Grid shape.
    pub const fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Whether the position lies on the grid.
    pub const fn contains(&self, pos: Position) -> bool {
        pos.x < self.config.width && pos.y < self.config.height
    }

    /// Cell positions in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.config.height)
            .flat_map(move |y| (0..self.config.width).map(move |x| Position::new(x, y)))
    }

    /// The patch on a cell.
    pub fn patch_at(&self, pos: Position) -> Option<EntityId> {
        self.index(pos).and_then(|i| self.cells.get(i).copied().flatten())
    }

    /// Cells around `pos` under the configured neighborhood. Never
    /// includes `pos` itself; each cell appears once even on grids small
    /// enough for wrapped offsets to coincide.
    pub fn neighbor_positions(&self, pos: Position) -> Vec<Position> {
        let width = i64::from(self.config.width);
        let height = i64::from(self.config.height);
        let mut out: Vec<Position> = Vec::new();
        for (dx, dy) in self.config.neighborhood.offsets() {
            let x = i64::from(pos.x).saturating_add(*dx);
            let y = i64::from(pos.y).saturating_add(*dy);
            let (x, y) = if self.config.wrap {
                (x.rem_euclid(width), y.rem_euclid(height))
            } else if (0..width).contains(&x) && (0..height).contains(&y) {
                (x, y)
            } else {
                continue;
            };
            let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
                continue;
            };
            let candidate = Position::new(x, y);
            if candidate != pos && !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out
    }

    /// Non-patch entities standing on a cell, in id order.
    pub fn occupants(&self, pos: Position) -> Vec<EntityId> {
        self.occupants
            .get(&pos)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_patch(&mut self, pos: Position, id: EntityId) -> Result<(), SpatialError> {
        let index = self.index(pos).ok_or(SpatialError::OutOfBounds(pos))?;
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = Some(id);
        }
        Ok(())
    }

    /// Forget a patch that is being removed.
    pub(crate) fn clear_patch(&mut self, pos: Position, id: EntityId) {
        if let Some(cell) = self.index(pos).and_then(|i| self.cells.get_mut(i)) {
            if *cell == Some(id) {
                *cell = None;
            }
        }
    }

    pub(crate) fn place(&mut self, id: EntityId, pos: Position) {
        self.occupants.entry(pos).or_default().insert(id);
    }

    pub(crate) fn vacate(&mut self, id: EntityId, pos: Position) {
        if let Some(ids) = self.occupants.get_mut(&pos) {
            ids.remove(&id);
            if ids.is_empty() {
                self.occupants.remove(&pos);
            }
        }
    }

    /// Drop every patch and occupant.
    pub(crate) fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.occupants.clear();
    }

    fn index(&self, pos: Position) -> Option<usize> {
        if !self.contains(pos) {
            return None;
        }
        let row = u64::from(pos.y).checked_mul(u64::from(self.config.width))?;
        usize::try_from(row.checked_add(u64::from(pos.x))?).ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn grid(width: u32, height: u32, neighborhood: Neighborhood, wrap: bool) -> Grid {
        Grid::new(GridConfig {
            width,
            height,
            neighborhood,
            wrap,
        })
        .unwrap()
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let config = GridConfig {
            width: 0,
            height: 5,
            neighborhood: Neighborhood::Four,
            wrap: false,
        };
        assert!(matches!(
            Grid::new(config),
            Err(SpatialError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn bounded_corner_has_fewer_neighbors() {
        let g = grid(5, 5, Neighborhood::Four, false);
        assert_eq!(g.neighbor_positions(Position::new(0, 0)).len(), 2);
        let g = grid(5, 5, Neighborhood::Eight, false);
        assert_eq!(g.neighbor_positions(Position::new(0, 0)).len(), 3);
        assert_eq!(g.neighbor_positions(Position::new(2, 2)).len(), 8);
    }

    #[test]
    fn wrapping_corner_reaches_opposite_edges() {
        let g = grid(5, 5, Neighborhood::Four, true);
        let around = g.neighbor_positions(Position::new(0, 0));
        assert_eq!(around.len(), 4);
        assert!(around.contains(&Position::new(4, 0)));
        assert!(around.contains(&Position::new(0, 4)));
    }

    #[test]
    fn small_wrapping_grid_deduplicates() {
        let g = grid(2, 1, Neighborhood::Eight, true);
        assert_eq!(
            g.neighbor_positions(Position::new(0, 0)),
            vec![Position::new(1, 0)]
        );
        let single = grid(1, 1, Neighborhood::Eight, true);
        assert!(single.neighbor_positions(Position::new(0, 0)).is_empty());
    }

    #[test]
    fn positions_are_row_major() {
        let g = grid(2, 2, Neighborhood::Four, false);
        let all: Vec<Position> = g.positions().collect();
        assert_eq!(
            all,
            vec![
                Position::new(0, 0),
                Position::new(1, 0),
                Position::new(0, 1),
                Position::new(1, 1)
            ]
        );
    }

    #[test]
    fn occupants_follow_place_and_vacate() {
        let mut g = grid(3, 3, Neighborhood::Four, false);
        let pos = Position::new(1, 1);
        g.place(EntityId(7), pos);
        g.place(EntityId(3), pos);
        assert_eq!(g.occupants(pos), vec![EntityId(3), EntityId(7)]);
        g.vacate(EntityId(3), pos);
        g.vacate(EntityId(7), pos);
        assert!(g.occupants(pos).is_empty());
    }

    #[test]
    fn patches_map_to_cells() {
        let mut g = grid(3, 2, Neighborhood::Four, false);
        g.set_patch(Position::new(2, 1), EntityId(5)).unwrap();
        assert_eq!(g.patch_at(Position::new(2, 1)), Some(EntityId(5)));
        assert!(g.set_patch(Position::new(3, 0), EntityId(6)).is_err());
        g.clear_patch(Position::new(2, 1), EntityId(5));
        assert_eq!(g.patch_at(Position::new(2, 1)), None);
    }
}
