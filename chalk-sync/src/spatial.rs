//! Uniform grid over stroke bounds for region queries.
//!
//! Each stroke is registered in every cell its bounding box touches, so a
//! region query only visits the cells under the region instead of the whole
//! canvas. Bounds are cached per stroke at insert time and never recomputed
//! from points.
//!
//! Very large boxes would touch an unbounded number of cells. Strokes wider
//! than [`MAX_SPAN`] cells on either axis live in a side list checked by
//! every query, and queries that wide scan the bounds cache directly.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::stroke::{BoundingBox, StrokeId};

/// Default cell edge in canvas units.
pub const CELL_SIZE: f32 = 256.0;

/// Widest cell span indexed through the grid.
pub const MAX_SPAN: i64 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CellKey(i32, i32);

#[derive(Debug, Clone)]
pub struct StrokeGrid {
    inv_cell_size: f32,
    grid: FxHashMap<CellKey, Vec<StrokeId>>,
    bounds: FxHashMap<StrokeId, BoundingBox>,
    oversized: Vec<StrokeId>,
}

impl Default for StrokeGrid {
    fn default() -> Self {
        Self::new(CELL_SIZE)
    }
}

impl StrokeGrid {
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            CELL_SIZE
        };
        Self {
            inv_cell_size: 1.0 / cell_size,
            grid: FxHashMap::default(),
            bounds: FxHashMap::default(),
            oversized: Vec::new(),
        }
    }

    #[inline]
    fn to_cell(&self, x: f32, y: f32) -> CellKey {
        CellKey(
            (x * self.inv_cell_size).floor() as i32,
            (y * self.inv_cell_size).floor() as i32,
        )
    }

    /// Cell range under `bbox`, or `None` if it spans more than `MAX_SPAN`.
    fn cell_range(&self, bbox: &BoundingBox) -> Option<(CellKey, CellKey)> {
        let min = self.to_cell(bbox.min_x, bbox.min_y);
        let max = self.to_cell(bbox.max_x, bbox.max_y);
        let span_x = i64::from(max.0) - i64::from(min.0);
        let span_y = i64::from(max.1) - i64::from(min.1);
        (span_x <= MAX_SPAN && span_y <= MAX_SPAN).then_some((min, max))
    }

    /// Register a stroke. Ids already present keep their first bounds.
    pub fn insert(&mut self, id: StrokeId, bbox: BoundingBox) {
        if self.bounds.contains_key(&id) {
            return;
        }
        self.bounds.insert(id, bbox);
        match self.cell_range(&bbox) {
            Some((min, max)) => {
                for cx in min.0..=max.0 {
                    for cy in min.1..=max.1 {
                        self.grid.entry(CellKey(cx, cy)).or_default().push(id);
                    }
                }
            }
            None => self.oversized.push(id),
        }
    }

    /// Ids whose bounds intersect `region`, in no particular order.
    pub fn query_region(&self, region: &BoundingBox) -> Vec<StrokeId> {
        let Some((min, max)) = self.cell_range(region) else {
            return self
                .bounds
                .iter()
                .filter(|(_, b)| b.intersects(region))
                .map(|(id, _)| *id)
                .collect();
        };

        let mut seen = FxHashSet::default();
        let mut result = Vec::new();
        for cx in min.0..=max.0 {
            for cy in min.1..=max.1 {
                let Some(ids) = self.grid.get(&CellKey(cx, cy)) else { continue };
                for &id in ids {
                    if seen.insert(id) && self.intersects(&id, region) {
                        result.push(id);
                    }
                }
            }
        }
        for &id in &self.oversized {
            if self.intersects(&id, region) {
                result.push(id);
            }
        }
        result
    }

    #[inline]
    fn intersects(&self, id: &StrokeId, region: &BoundingBox) -> bool {
        self.bounds.get(id).is_some_and(|b| b.intersects(region))
    }

    /// Cached bounds of a registered stroke.
    pub fn bounds_of(&self, id: &StrokeId) -> Option<BoundingBox> {
        self.bounds.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Number of occupied grid cells.
    pub fn cell_count(&self) -> usize {
        self.grid.len()
    }
}
