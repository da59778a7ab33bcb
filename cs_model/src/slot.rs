//! The one-word (or two-word, for wide values) value cell that backs
//! every local variable and operand stack position.
//!
//! The source VM stores this as an untagged C union (`config.hpp`'s
//! `union Slot`) with a parallel `SlotTypeEnum` tag tracked by the
//! frame. Rust has no safe untagged union we'd want here, so `Slot`
//! is a real tagged enum; `SlotKind` is kept as a separate type
//! anyway because the frame and GC need to record a slot's type
//! *independently* of holding a value (e.g. an unoccupied, default
//! "NONE" local), matching the original's parallel-array design.

use crate::ObjRef;

/// A single stack/local slot. Long and double values are logically
/// "wide": the interpreter must reserve two adjacent slot positions
/// for them, with the second position left as [`Slot::Padding`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// `None` is a null reference; `Some` is a handle into the heap.
    Reference(Option<ObjRef>),
    /// The dead second half of a wide value, or an unset local.
    Padding,
}

impl Slot {
    pub const NULL: Slot = Slot::Reference(None);

    pub fn kind(self) -> SlotKind {
        match self {
            Slot::Int(_) => SlotKind::Int,
            Slot::Long(_) => SlotKind::Long,
            Slot::Float(_) => SlotKind::Float,
            Slot::Double(_) => SlotKind::Double,
            Slot::Reference(_) => SlotKind::Reference,
            Slot::Padding => SlotKind::None,
        }
    }

    /// How many slot positions this value occupies (1, or 2 for wide
    /// values including their padding companion).
    pub fn width(self) -> usize {
        self.kind().width()
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Slot::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(self) -> Option<i64> {
        match self {
            Slot::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(self) -> Option<f32> {
        match self {
            Slot::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_double(self) -> Option<f64> {
        match self {
            Slot::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(self) -> Option<Option<ObjRef>> {
        match self {
            Slot::Reference(v) => Some(v),
            _ => None,
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Slot::Padding
    }
}

/// Dynamic type tag for a slot, tracked in a parallel array next to
/// local tables and operand stacks so the GC can scan reference slots
/// without re-deriving type information from bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    None,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl SlotKind {
    pub fn is_wide(self) -> bool {
        matches!(self, SlotKind::Long | SlotKind::Double)
    }

    pub fn width(self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// The slot kind implied by the first character of a field
    /// descriptor (`L`/`[` => reference, `F` => float, `J` => long,
    /// `D` => double, everything else narrows to int).
    pub fn from_descriptor_first_char(c: char) -> SlotKind {
        match c {
            'L' | '[' => SlotKind::Reference,
            'F' => SlotKind::Float,
            'J' => SlotKind::Long,
            'D' => SlotKind::Double,
            _ => SlotKind::Int,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_slots_occupy_two_positions() {
        assert_eq!(Slot::Long(42).width(), 2);
        assert_eq!(Slot::Double(1.5).width(), 2);
        assert_eq!(Slot::Int(1).width(), 1);
        assert_eq!(Slot::Reference(None).width(), 1);
    }

    #[test]
    fn descriptor_first_char_maps_to_kind() {
        assert_eq!(SlotKind::from_descriptor_first_char('I'), SlotKind::Int);
        assert_eq!(SlotKind::from_descriptor_first_char('J'), SlotKind::Long);
        assert_eq!(SlotKind::from_descriptor_first_char('['), SlotKind::Reference);
    }
}
