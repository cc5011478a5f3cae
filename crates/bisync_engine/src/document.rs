//! The representations kept consistent by the engine.
//!
//! The engine never looks inside a payload. Parsing and rendering belong to
//! the [`Transformer`](crate::Transformer) collaborators.

use crate::clock::Timestamp;
use crate::state::Side;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Both side representations plus the authoritative intermediate model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    side_a: Bytes,
    side_b: Bytes,
    model: Bytes,
}

impl Document {
    /// Creates a document from its three representations.
    pub fn new(side_a: impl Into<Bytes>, side_b: impl Into<Bytes>, model: impl Into<Bytes>) -> Self {
        Self {
            side_a: side_a.into(),
            side_b: side_b.into(),
            model: model.into(),
        }
    }

    /// Returns the representation of `side`.
    pub fn side(&self, side: Side) -> &Bytes {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }

    /// Returns the authoritative model.
    pub fn model(&self) -> &Bytes {
        &self.model
    }

    /// Replaces the representation of `side` with user content.
    pub(crate) fn set_side(&mut self, side: Side, content: Bytes) {
        match side {
            Side::A => self.side_a = content,
            Side::B => self.side_b = content,
        }
    }

    /// Applies a successful conversion that started from `origin`.
    ///
    /// The origin keeps the user's content; the model and the other side take
    /// the converter's output.
    pub(crate) fn apply_conversion(&mut self, origin: Side, converted: Converted) {
        self.model = converted.model;
        self.set_side(origin.other(), converted.output);
    }
}

/// The output of a successful conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Converted {
    /// The new authoritative model.
    pub model: Bytes,
    /// The rendering for the side opposite the origin.
    pub output: Bytes,
}

impl Converted {
    /// Creates a conversion output.
    pub fn new(model: impl Into<Bytes>, output: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            output: output.into(),
        }
    }
}

/// An edit held back while a conversion from the same side is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEdit {
    /// The side the edit belongs to.
    pub side: Side,
    /// The full content of that side after the edit.
    pub content: Bytes,
    /// When the edit arrived.
    pub timestamp: Timestamp,
    /// True if this edit overwrote an earlier buffered one.
    pub is_override: bool,
}
