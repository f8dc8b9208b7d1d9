//! Stroke model: the atomic drawing operation and its identity.
//!
//! A stroke is immutable once created. Its `id` is globally unique and its
//! `vector_clock` records what its author had observed when drawing it, with
//! the author's own counter bumped by one.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::clock::VectorClock;

/// Globally unique stroke identifier.
pub type StrokeId = Uuid;

/// Widest stroke accepted, in canvas units.
pub const MAX_WIDTH: f32 = 512.0;

/// One sampled point of a stroke path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    /// Stylus pressure in [0, 1]; mice report 0.5.
    pub pressure: f32,
    /// Milliseconds since the stroke started.
    pub timestamp: u64,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            pressure: 0.5,
            timestamp: 0,
        }
    }

    pub fn with_pressure(x: f32, y: f32, pressure: f32, timestamp: u64) -> Self {
        Self {
            x,
            y,
            pressure,
            timestamp,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.pressure.is_finite()
            && (0.0..=1.0).contains(&self.pressure)
    }
}

/// Drawing tool. Unknown names survive decoding so that validation can
/// reject them with a precise error instead of a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tool {
    Pencil,
    /// Paints the canvas background over everything ordered before it.
    Eraser,
    Unknown(String),
}

impl Tool {
    pub fn as_str(&self) -> &str {
        match self {
            Tool::Pencil => "pencil",
            Tool::Eraser => "eraser",
            Tool::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Tool::Unknown(_))
    }
}

impl From<String> for Tool {
    fn from(name: String) -> Self {
        match name.as_str() {
            "pencil" => Tool::Pencil,
            "eraser" => Tool::Eraser,
            _ => Tool::Unknown(name),
        }
    }
}

impl From<Tool> for String {
    fn from(tool: Tool) -> Self {
        match tool {
            Tool::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// RGBA colour, written as `#rrggbb` or `#rrggbbaa` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    /// Canvas background, painted by the eraser.
    pub const WHITE: Color = Color::rgb(0xff, 0xff, 0xff);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xff }
    }

    /// Parse `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if !digits.is_ascii() {
            return None;
        }
        let byte = |i: usize| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok();
        match digits.len() {
            6 => Some(Self::rgb(byte(0)?, byte(2)?, byte(4)?)),
            8 => Some(Self {
                r: byte(0)?,
                g: byte(2)?,
                b: byte(4)?,
                a: byte(6)?,
            }),
            _ => None,
        }
    }

    pub fn to_hex(&self) -> String {
        if self.a == 0xff {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::from_hex(&value).ok_or_else(|| format!("invalid colour '{value}'"))
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_hex()
    }
}

/// Axis-aligned rectangle in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl BoundingBox {
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Smallest box covering every point, inflated by half the line width.
    pub fn of_points(points: &[Point], width: f32) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self::new(first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            bbox.min_x = bbox.min_x.min(p.x);
            bbox.min_y = bbox.min_y.min(p.y);
            bbox.max_x = bbox.max_x.max(p.x);
            bbox.max_y = bbox.max_y.max(p.y);
        }
        let pad = width / 2.0;
        bbox.min_x -= pad;
        bbox.min_y -= pad;
        bbox.max_x += pad;
        bbox.max_y += pad;
        Some(bbox)
    }

    /// Edge-inclusive overlap test.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }
}

/// Reasons a stroke is refused at ingress.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("stroke has no points")]
    EmptyPoints,
    #[error("point {index} has a non-finite coordinate or out-of-range pressure")]
    NonFinitePoint { index: usize },
    #[error("invalid stroke width {0}")]
    InvalidWidth(f32),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("stroke has no author")]
    MissingAuthor,
    #[error("vector clock has no entry for its author")]
    MissingOwnClock,
    #[error("replayed stroke from {author}: counter {counter} already seen (last {seen})")]
    Replay {
        author: String,
        counter: u64,
        seen: u64,
    },
}

/// One atomic drawing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub id: StrokeId,
    pub whiteboard_id: Uuid,
    pub author: String,
    pub points: Vec<Point>,
    pub color: Color,
    pub width: f32,
    pub tool: Tool,
    pub vector_clock: VectorClock,
    /// Milliseconds since the Unix epoch, informational only.
    pub created_at: u64,
}

impl Stroke {
    /// Create a stroke with a fresh id.
    ///
    /// `vector_clock` must already carry the author's bumped counter.
    pub fn new(
        whiteboard_id: Uuid,
        author: impl Into<String>,
        points: Vec<Point>,
        color: Color,
        width: f32,
        tool: Tool,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            whiteboard_id,
            author: author.into(),
            points,
            color,
            width,
            tool,
            vector_clock,
            created_at: now_millis(),
        }
    }

    /// The author's own counter in the stroke's clock.
    pub fn own_counter(&self) -> u64 {
        self.vector_clock.get(&self.author)
    }

    /// Region this stroke paints.
    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::of_points(&self.points, self.width)
    }

    /// Colour actually painted.
    pub fn paint_color(&self) -> Color {
        match self.tool {
            Tool::Eraser => Color::WHITE,
            _ => self.color,
        }
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            depth: self.vector_clock.depth(),
            author: self.author.clone(),
            id: self.id,
        }
    }
}

/// Position of a stroke in the deterministic merge order.
///
/// Causal depth first, which keeps every stroke after the strokes it
/// causally depends on; then `(author, id)` among strokes at equal depth.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub depth: u64,
    pub author: String,
    pub id: StrokeId,
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.depth, self.author, self.id)
    }
}

/// Check a stroke before it may enter a log or a canvas.
///
/// `seen` holds the highest own counter already accepted for each author.
pub fn validate(stroke: &Stroke, seen: &VectorClock) -> Result<(), ValidationError> {
    if stroke.author.is_empty() {
        return Err(ValidationError::MissingAuthor);
    }
    if stroke.points.is_empty() {
        return Err(ValidationError::EmptyPoints);
    }
    if let Some(index) = stroke.points.iter().position(|p| !p.is_finite()) {
        return Err(ValidationError::NonFinitePoint { index });
    }
    if !stroke.width.is_finite() || stroke.width <= 0.0 || stroke.width > MAX_WIDTH {
        return Err(ValidationError::InvalidWidth(stroke.width));
    }
    if !stroke.tool.is_known() {
        return Err(ValidationError::UnknownTool(stroke.tool.as_str().to_string()));
    }

    let counter = stroke.own_counter();
    if counter == 0 {
        return Err(ValidationError::MissingOwnClock);
    }
    let last = seen.get(&stroke.author);
    if counter <= last {
        return Err(ValidationError::Replay {
            author: stroke.author.clone(),
            counter,
            seen: last,
        });
    }
    Ok(())
}

/// Total order used by every replica to lay strokes on the canvas.
///
/// A stroke whose clock is dominated by another's always sorts first.
/// Concurrent strokes sort by causal depth, then `(author, id)`; the result
/// never depends on arrival order or wall-clock time.
pub fn merge_order_key(a: &Stroke, b: &Stroke) -> Ordering {
    if a.id == b.id {
        return Ordering::Equal;
    }
    a.order_key().cmp(&b.order_key())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
