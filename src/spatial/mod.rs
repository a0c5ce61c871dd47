//! Spatial primitives: bounding rectangles and key-pointer entries.

mod rtree;

pub use rtree::{NodeVisit, RTree, RTreeOptions};

use crate::error::{Result, SelvaError};

/// Encoded size of a [`Rect`]: four little-endian f64 values.
pub const RECT_ENCODED_SIZE: usize = 32;
/// Encoded size of a [`SpatialEntry`]: rectangle plus u64 id.
pub const ENTRY_ENCODED_SIZE: usize = RECT_ENCODED_SIZE + 8;

/// Axis-aligned minimum bounding rectangle in two dimensions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    /// Lower corner (inclusive).
    pub min: [f64; 2],
    /// Upper corner (inclusive).
    pub max: [f64; 2],
}

impl Rect {
    /// Creates a rectangle from its corners.
    pub fn new(min: [f64; 2], max: [f64; 2]) -> Self {
        Self { min, max }
    }

    /// Degenerate rectangle covering a single point.
    pub fn point(p: [f64; 2]) -> Self {
        Self { min: p, max: p }
    }

    /// True when `self` and `other` share any point.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min[0] <= other.max[0]
            && other.min[0] <= self.max[0]
            && self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        self.min[0] <= other.min[0]
            && self.min[1] <= other.min[1]
            && self.max[0] >= other.max[0]
            && self.max[1] >= other.max[1]
    }

    /// Smallest rectangle covering both inputs.
    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
            ],
        }
    }

    /// Area of the rectangle.
    pub fn area(&self) -> f64 {
        (self.max[0] - self.min[0]) * (self.max[1] - self.min[1])
    }

    /// Area growth needed to absorb `other`.
    pub fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Encodes the rectangle in fixed field order.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.min[0].to_le_bytes());
        out.extend_from_slice(&self.min[1].to_le_bytes());
        out.extend_from_slice(&self.max[0].to_le_bytes());
        out.extend_from_slice(&self.max[1].to_le_bytes());
    }

    /// Decodes a rectangle written by [`Rect::encode_into`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECT_ENCODED_SIZE {
            return Err(SelvaError::Corruption("rectangle encoding truncated".into()));
        }
        let f = |i: usize| {
            f64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().expect("8 bytes"))
        };
        Ok(Self {
            min: [f(0), f(1)],
            max: [f(2), f(3)],
        })
    }
}

/// A spatial record: bounding rectangle plus payload identifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialEntry {
    /// Minimum bounding rectangle of the indexed object.
    pub mbr: Rect,
    /// Identifier of the indexed payload.
    pub id: u64,
}

impl SpatialEntry {
    /// Creates an entry.
    pub fn new(mbr: Rect, id: u64) -> Self {
        Self { mbr, id }
    }

    /// Encodes the entry in fixed field order.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.mbr.encode_into(out);
        out.extend_from_slice(&self.id.to_le_bytes());
    }

    /// Decodes an entry written by [`SpatialEntry::encode_into`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENTRY_ENCODED_SIZE {
            return Err(SelvaError::Corruption(
                "spatial entry encoding truncated".into(),
            ));
        }
        let mbr = Rect::decode(&bytes[..RECT_ENCODED_SIZE])?;
        let id = u64::from_le_bytes(
            bytes[RECT_ENCODED_SIZE..ENTRY_ENCODED_SIZE]
                .try_into()
                .expect("8 bytes"),
        );
        Ok(Self { mbr, id })
    }
}
