//! Canvas state derived from the set of applied strokes.
//!
//! The canvas is a vector scene: strokes kept in merge order. Painting them
//! in that order yields the picture, with later strokes (and erasers) drawn
//! over earlier ones. Because the order is a pure function of stroke data,
//! two canvases holding the same stroke set are identical, and encode to
//! identical bytes.
//!
//! A [`StrokeGrid`] indexes cached stroke bounds, so recomputing a region
//! only touches the strokes near it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::spatial::StrokeGrid;
use crate::stroke::{BoundingBox, OrderKey, Stroke, StrokeId};

/// Incremental render update for one region of the canvas.
///
/// `ops` lists, in paint order, every stroke overlapping `region`. A renderer
/// clears `region` and repaints these strokes clipped to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasDelta {
    pub whiteboard_id: Uuid,
    /// Log position this delta reflects, when known.
    pub lsn: Option<u64>,
    pub region: BoundingBox,
    pub ops: Vec<Stroke>,
}

/// Ordered stroke set for one whiteboard.
#[derive(Debug, Clone, Default)]
pub struct CanvasState {
    strokes: BTreeMap<OrderKey, Stroke>,
    index: HashMap<StrokeId, OrderKey>,
    grid: StrokeGrid,
    bounds: Option<BoundingBox>,
}

impl CanvasState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from strokes in any order. Duplicate ids collapse.
    pub fn from_strokes(strokes: impl IntoIterator<Item = Stroke>) -> Self {
        let mut canvas = Self::new();
        for stroke in strokes {
            canvas.insert(stroke);
        }
        canvas
    }

    /// Insert a stroke. Returns `false` if its id is already present.
    pub fn insert(&mut self, stroke: Stroke) -> bool {
        if self.index.contains_key(&stroke.id) {
            return false;
        }
        if let Some(b) = stroke.bounds() {
            self.grid.insert(stroke.id, b);
            self.bounds = Some(match self.bounds {
                Some(total) => total.union(&b),
                None => b,
            });
        }
        let key = stroke.order_key();
        self.index.insert(stroke.id, key.clone());
        self.strokes.insert(key, stroke);
        true
    }

    pub fn contains(&self, id: &StrokeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &StrokeId) -> Option<&Stroke> {
        self.index.get(id).and_then(|key| self.strokes.get(key))
    }

    /// Strokes in paint order.
    pub fn strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.strokes.values()
    }

    /// Strokes overlapping `region`, in paint order.
    pub fn strokes_in(&self, region: &BoundingBox) -> Vec<Stroke> {
        let mut keys: Vec<&OrderKey> = self
            .grid
            .query_region(region)
            .iter()
            .filter_map(|id| self.index.get(id))
            .collect();
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|key| self.strokes.get(key))
            .cloned()
            .collect()
    }

    /// Recompute the render ops for `region` only.
    pub fn delta_for(&self, whiteboard_id: Uuid, region: BoundingBox, lsn: Option<u64>) -> CanvasDelta {
        CanvasDelta {
            whiteboard_id,
            lsn,
            region,
            ops: self.strokes_in(&region),
        }
    }

    /// Union of all stroke bounds.
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    /// Canonical byte encoding: strokes in paint order, bincode.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let ordered: Vec<&Stroke> = self.strokes.values().collect();
        // Encoding plain data into a Vec cannot fail.
        bincode::serde::encode_to_vec(&ordered, bincode::config::standard()).unwrap_or_default()
    }

    /// FNV-1a digest of the canonical encoding.
    pub fn digest(&self) -> u64 {
        fnv1a64(&self.canonical_bytes())
    }
}

impl PartialEq for CanvasState {
    fn eq(&self, other: &Self) -> bool {
        self.strokes.len() == other.strokes.len()
            && self.strokes.keys().eq(other.strokes.keys())
            && self.strokes.values().eq(other.strokes.values())
    }
}

/// 64-bit FNV-1a.
pub(crate) fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
