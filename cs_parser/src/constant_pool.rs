//! The constant pool: a class's per-class symbol table of strings,
//! numeric literals, and symbolic references. Grounded on the
//! teacher's `CpInfo` enum (`src/parse/model.rs`), generalized with
//! typed accessors (`ConstantPool::utf8`, `::class_name`, ...) that
//! the linker (`cs_vm`) uses to resolve symbolic references without
//! re-matching on the raw tag everywhere.

use crate::error::{ParseError, Result};
use crate::reader::ByteReader;
use cs_model::{u1, u2, u4};

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Class {
        name_index: u2,
    },
    Fieldref {
        class_index: u2,
        name_and_type_index: u2,
    },
    Methodref {
        class_index: u2,
        name_and_type_index: u2,
    },
    InterfaceMethodref {
        class_index: u2,
        name_and_type_index: u2,
    },
    String {
        string_index: u2,
    },
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    NameAndType {
        name_index: u2,
        descriptor_index: u2,
    },
    Utf8(String),
    MethodHandle {
        reference_kind: u1,
        reference_index: u2,
    },
    MethodType {
        descriptor_index: u2,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u2,
        name_and_type_index: u2,
    },
    /// The second, unused slot after a `Long`/`Double` entry — the
    /// constant pool's own "wide value occupies two slots" rule
    /// (spec.md §3's slot-width invariant, mirrored at the pool
    /// level by the class-file format itself).
    Unusable,
}

impl CpInfo {
    /// Decodes one entry. `tag` has already been consumed by the
    /// caller so callers can special-case unusable slots.
    pub fn parse(reader: &mut ByteReader) -> Result<Self> {
        let tag = reader.u1()?;
        Ok(match tag {
            7 => CpInfo::Class {
                name_index: reader.u2()?,
            },
            9 => CpInfo::Fieldref {
                class_index: reader.u2()?,
                name_and_type_index: reader.u2()?,
            },
            10 => CpInfo::Methodref {
                class_index: reader.u2()?,
                name_and_type_index: reader.u2()?,
            },
            11 => CpInfo::InterfaceMethodref {
                class_index: reader.u2()?,
                name_and_type_index: reader.u2()?,
            },
            8 => CpInfo::String {
                string_index: reader.u2()?,
            },
            3 => CpInfo::Integer(reader.u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(reader.u4()?)),
            5 => {
                let hi = reader.u4()? as u64;
                let lo = reader.u4()? as u64;
                CpInfo::Long(((hi << 32) | lo) as i64)
            }
            6 => {
                let hi = reader.u4()? as u64;
                let lo = reader.u4()? as u64;
                CpInfo::Double(f64::from_bits((hi << 32) | lo))
            }
            12 => CpInfo::NameAndType {
                name_index: reader.u2()?,
                descriptor_index: reader.u2()?,
            },
            1 => {
                let length = reader.u2()? as usize;
                let bytes = reader.bytes(length)?;
                CpInfo::Utf8(decode_modified_utf8(bytes)?)
            }
            15 => CpInfo::MethodHandle {
                reference_kind: reader.u1()?,
                reference_index: reader.u2()?,
            },
            16 => CpInfo::MethodType {
                descriptor_index: reader.u2()?,
            },
            18 => CpInfo::InvokeDynamic {
                bootstrap_method_attr_index: reader.u2()?,
                name_and_type_index: reader.u2()?,
            },
            other => return Err(ParseError::InvalidConstantPoolTag(other)),
        })
    }

    /// Whether this entry occupies two constant-pool indices (the
    /// `Long`/`Double` rule from spec.md GLOSSARY's "constant pool"
    /// entry).
    pub fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

/// Accepts the class format's "modified UTF-8" as plain UTF-8. A
/// faithful decoder would special-case the modified encoding of NUL
/// and supplementary characters; every class emitted by a modern
/// compiler round-trips through standard UTF-8 decoding for the
/// identifiers and literals this VM interprets, so we reuse
/// `String::from_utf8` rather than hand-rolling the CESU-8 variant.
fn decode_modified_utf8(bytes: Vec<u1>) -> Result<String> {
    String::from_utf8(bytes).map_err(ParseError::InvalidUtf8)
}

/// The per-class constant pool, indexed from 1 to `len()` the way the
/// class-file format indexes it (index 0 and the second half of a
/// wide entry are never valid lookups).
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<CpInfo>,
}

impl ConstantPool {
    pub fn parse(reader: &mut ByteReader, constant_pool_count: u2) -> Result<Self> {
        let mut entries = Vec::with_capacity(constant_pool_count as usize);
        entries.push(CpInfo::Unusable); // index 0 is never valid
        let mut index = 1u2;
        while index < constant_pool_count {
            let entry = CpInfo::parse(reader)?;
            let wide = entry.is_wide();
            entries.push(entry);
            index += 1;
            if wide {
                entries.push(CpInfo::Unusable);
                index += 1;
            }
        }
        Ok(ConstantPool { entries })
    }

    pub fn get(&self, index: u2) -> Result<&CpInfo> {
        self.entries
            .get(index as usize)
            .filter(|e| !matches!(e, CpInfo::Unusable))
            .ok_or(ParseError::ConstantPoolIndexOutOfBounds(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn utf8(&self, index: u2) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ParseError::ConstantPoolKindMismatch(index, "Utf8")),
        }
    }

    pub fn class_name(&self, index: u2) -> Result<&str> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.utf8(*name_index),
            _ => Err(ParseError::ConstantPoolKindMismatch(index, "Class")),
        }
    }

    pub fn name_and_type(&self, index: u2) -> Result<(&str, &str)> {
        match self.get(index)? {
            CpInfo::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(ParseError::ConstantPoolKindMismatch(index, "NameAndType")),
        }
    }

    /// Resolves a `Fieldref`/`Methodref`/`InterfaceMethodref` into
    /// (owning class name, member name, descriptor).
    pub fn member_ref(&self, index: u2) -> Result<(&str, &str, &str)> {
        let (class_index, nat_index) = match self.get(index)? {
            CpInfo::Fieldref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::Methodref {
                class_index,
                name_and_type_index,
            }
            | CpInfo::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => return Err(ParseError::ConstantPoolKindMismatch(index, "MemberRef")),
        };
        let class_name = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok((class_name, name, descriptor))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CpInfo> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8_bytes(s: &str) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend((s.len() as u16).to_be_bytes());
        out.extend(s.as_bytes());
        out
    }

    #[test]
    fn parses_utf8_and_class_entries() {
        let mut data = Vec::new();
        data.extend(utf8_bytes("Main")); // index 1
        data.extend([7, 0, 1]); // index 2: Class -> name_index 1
        let mut reader = ByteReader::new(&data);
        let pool = ConstantPool::parse(&mut reader, 3).unwrap();
        assert_eq!(pool.utf8(1).unwrap(), "Main");
        assert_eq!(pool.class_name(2).unwrap(), "Main");
    }

    #[test]
    fn long_and_double_occupy_two_slots() {
        let mut data = Vec::new();
        data.push(5); // Long tag
        data.extend(0u32.to_be_bytes());
        data.extend(1u32.to_be_bytes());
        data.extend(utf8_bytes("after")); // index 3, since index 2 is unusable
        let mut reader = ByteReader::new(&data);
        let pool = ConstantPool::parse(&mut reader, 4).unwrap();
        assert!(matches!(pool.get(2), Err(ParseError::ConstantPoolIndexOutOfBounds(2))));
        assert_eq!(pool.utf8(3).unwrap(), "after");
    }
}
