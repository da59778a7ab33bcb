//! Field and method descriptor parsing.
//!
//! Grounded on the teacher's `class-struct` crate (`FieldDescriptor`,
//! `FieldType`, `MethodDescriptor`), generalized so the VM can derive
//! slot counts and [`SlotKind`]s directly from a descriptor string
//! without re-walking it — the `Method` record in spec.md §3 needs
//! "parameter slot types" and "return slot type" computed once at
//! link time.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::slot::SlotKind;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("empty descriptor")]
    Empty,
    #[error("method descriptor must start with '('")]
    MissingOpenParen,
    #[error("invalid character '{0}' in descriptor")]
    InvalidChar(char),
    #[error("unterminated class name in descriptor (missing ';')")]
    UnterminatedClassName,
}

/// The type of a field, a method parameter, or (wrapped in
/// [`MethodReturn`]) a method's return value.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    /// `L ClassName ;`
    Object(String),
    Short,
    Boolean,
    /// `[` component
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn slot_kind(&self) -> SlotKind {
        match self {
            FieldType::Double => SlotKind::Double,
            FieldType::Float => SlotKind::Float,
            FieldType::Long => SlotKind::Long,
            FieldType::Object(_) | FieldType::Array(_) => SlotKind::Reference,
            FieldType::Byte
            | FieldType::Char
            | FieldType::Int
            | FieldType::Short
            | FieldType::Boolean => SlotKind::Int,
        }
    }

    /// Parses as much of the iterator as one field type needs.
    pub fn from_char_iter(chars: &mut Peekable<Chars>) -> Result<Self, DescriptorError> {
        let first = chars.next().ok_or(DescriptorError::Empty)?;
        Ok(match first {
            'B' => FieldType::Byte,
            'C' => FieldType::Char,
            'D' => FieldType::Double,
            'F' => FieldType::Float,
            'I' => FieldType::Int,
            'J' => FieldType::Long,
            'S' => FieldType::Short,
            'Z' => FieldType::Boolean,
            'L' => {
                let mut name = String::with_capacity(32);
                loop {
                    let c = chars.next().ok_or(DescriptorError::UnterminatedClassName)?;
                    if c == ';' {
                        break;
                    }
                    name.push(c);
                }
                FieldType::Object(name)
            }
            '[' => FieldType::Array(Box::new(FieldType::from_char_iter(chars)?)),
            c => return Err(DescriptorError::InvalidChar(c)),
        })
    }

    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let mut chars = s.chars().peekable();
        let ty = FieldType::from_char_iter(&mut chars)?;
        Ok(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => write!(f, "B"),
            FieldType::Char => write!(f, "C"),
            FieldType::Double => write!(f, "D"),
            FieldType::Float => write!(f, "F"),
            FieldType::Int => write!(f, "I"),
            FieldType::Long => write!(f, "J"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Short => write!(f, "S"),
            FieldType::Boolean => write!(f, "Z"),
            FieldType::Array(inner) => write!(f, "[{inner}"),
        }
    }
}

/// The return type of a method: either `void` or a [`FieldType`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum MethodReturn {
    Void,
    Value(FieldType),
}

impl MethodReturn {
    pub fn slot_kind(&self) -> SlotKind {
        match self {
            MethodReturn::Void => SlotKind::None,
            MethodReturn::Value(ty) => ty.slot_kind(),
        }
    }
}

/// A method descriptor: `(parameter types) return type`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MethodDescriptor {
    pub parameters: Vec<FieldType>,
    pub return_type: MethodReturn,
}

impl MethodDescriptor {
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        let mut chars = s.chars().peekable();
        if chars.next() != Some('(') {
            return Err(DescriptorError::MissingOpenParen);
        }

        let mut parameters = Vec::new();
        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                Some(_) => parameters.push(FieldType::from_char_iter(&mut chars)?),
                None => return Err(DescriptorError::UnterminatedClassName),
            }
        }

        let return_type = if chars.peek() == Some(&'V') {
            chars.next();
            MethodReturn::Void
        } else {
            MethodReturn::Value(FieldType::from_char_iter(&mut chars)?)
        };

        Ok(MethodDescriptor {
            parameters,
            return_type,
        })
    }

    /// Total slot width of the parameters, counting wide types twice
    /// and *without* an implicit `this` slot (the frame adds that).
    pub fn parameter_slot_width(&self) -> usize {
        self.parameters.iter().map(|p| p.slot_kind().width()).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.parameters {
            write!(f, "{p}")?;
        }
        write!(f, ")")?;
        match &self.return_type {
            MethodReturn::Void => write!(f, "V"),
            MethodReturn::Value(ty) => write!(f, "{ty}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive_field_descriptors() {
        assert_eq!(FieldType::parse("I").unwrap(), FieldType::Int);
        assert_eq!(FieldType::parse("J").unwrap(), FieldType::Long);
        assert_eq!(
            FieldType::parse("[[I").unwrap(),
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Int))))
        );
    }

    #[test]
    fn parses_object_field_descriptor() {
        assert_eq!(
            FieldType::parse("Ljava/lang/String;").unwrap(),
            FieldType::Object("java/lang/String".to_string())
        );
    }

    #[test]
    fn parses_method_descriptor_with_mixed_params() {
        let desc = MethodDescriptor::parse("(ILjava/lang/String;D)V").unwrap();
        assert_eq!(desc.parameters.len(), 3);
        assert_eq!(desc.return_type, MethodReturn::Void);
        // I (1) + ref (1) + D (2) = 4
        assert_eq!(desc.parameter_slot_width(), 4);
    }

    #[test]
    fn parses_static_add_descriptor() {
        let desc = MethodDescriptor::parse("(II)I").unwrap();
        assert_eq!(desc.parameters, vec![FieldType::Int, FieldType::Int]);
        assert_eq!(desc.return_type, MethodReturn::Value(FieldType::Int));
    }

    #[test]
    fn rejects_missing_semicolon() {
        assert!(matches!(
            FieldType::parse("Ljava/lang/String"),
            Err(DescriptorError::UnterminatedClassName)
        ));
    }
}
