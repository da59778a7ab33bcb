//! Attribute parsing.
//!
//! Grounded on the teacher's two-pass design in `src/parse/mod.rs`:
//! every attribute is first read as a raw `attribute_name_index` +
//! byte blob, then re-parsed into its typed shape once the constant
//! pool is available to resolve the name. We keep that two-pass shape
//! (`RawAttribute` -> `Attribute`) but drop the teacher's redundant
//! `attribute_name_index`/`attribute_length` fields duplicated inside
//! every variant — the outer `RawAttribute` already carries them, and
//! nothing downstream of parsing needs them again.

use crate::constant_pool::ConstantPool;
use crate::error::{ParseError, Result};
use crate::reader::ByteReader;
use cs_model::{u1, u2, u4};

#[derive(Debug, Clone)]
pub struct RawAttribute {
    pub name_index: u2,
    pub content: Vec<u1>,
}

impl RawAttribute {
    pub fn parse(reader: &mut ByteReader) -> Result<Self> {
        let name_index = reader.u2()?;
        let length = reader.u4()? as usize;
        let content = reader.bytes(length)?;
        Ok(RawAttribute { name_index, content })
    }

    pub fn resolve(&self, pool: &ConstantPool) -> Result<Attribute> {
        let name = pool
            .utf8(self.name_index)
            .map_err(|_| ParseError::AttributeNameNotUtf8(self.name_index))?;
        let mut reader = ByteReader::new(&self.content);
        Attribute::parse_known(name, &mut reader)
    }
}

#[derive(Debug, Clone)]
pub struct ExceptionTableEntry {
    pub start_pc: u2,
    pub end_pc: u2,
    pub handler_pc: u2,
    /// `None` catches everything (a `finally` block); `Some` is a
    /// constant-pool `Class` index that must be a superclass of the
    /// thrown object's class to match (spec.md §4.2).
    pub catch_type: Option<u2>,
}

impl ExceptionTableEntry {
    fn parse(reader: &mut ByteReader) -> Result<Self> {
        let start_pc = reader.u2()?;
        let end_pc = reader.u2()?;
        let handler_pc = reader.u2()?;
        let catch_type = match reader.u2()? {
            0 => None,
            n => Some(n),
        };
        Ok(ExceptionTableEntry {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LineNumberEntry {
    pub start_pc: u2,
    pub line_number: u2,
}

#[derive(Debug, Clone)]
pub struct LocalVariableEntry {
    pub start_pc: u2,
    pub length: u2,
    pub name_index: u2,
    pub descriptor_or_signature_index: u2,
    pub index: u2,
}

#[derive(Debug, Clone)]
pub struct InnerClassEntry {
    pub inner_class_info_index: u2,
    pub outer_class_info_index: u2,
    pub inner_class_name_index: u2,
    pub inner_class_access_flags: u2,
}

#[derive(Debug, Clone)]
pub struct BootstrapMethodEntry {
    pub bootstrap_method_ref: u2,
    pub bootstrap_arguments: Vec<u2>,
}

#[derive(Debug, Clone)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Object { cpool_index: u2 },
    Uninitialized { offset: u2 },
}

impl VerificationTypeInfo {
    fn parse(reader: &mut ByteReader) -> Result<Self> {
        let tag = reader.u1()?;
        Ok(match tag {
            0 => VerificationTypeInfo::Top,
            1 => VerificationTypeInfo::Integer,
            2 => VerificationTypeInfo::Float,
            3 => VerificationTypeInfo::Double,
            4 => VerificationTypeInfo::Long,
            5 => VerificationTypeInfo::Null,
            6 => VerificationTypeInfo::UninitializedThis,
            7 => VerificationTypeInfo::Object {
                cpool_index: reader.u2()?,
            },
            8 => VerificationTypeInfo::Uninitialized {
                offset: reader.u2()?,
            },
            other => return Err(ParseError::InvalidVerificationTypeTag(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub enum StackMapFrame {
    Same { offset_delta: u2 },
    SameLocals1StackItem { offset_delta: u2, stack: VerificationTypeInfo },
    Chop { offset_delta: u2, k: u1 },
    SameExtended { offset_delta: u2 },
    Append { offset_delta: u2, locals: Vec<VerificationTypeInfo> },
    Full {
        offset_delta: u2,
        locals: Vec<VerificationTypeInfo>,
        stack: Vec<VerificationTypeInfo>,
    },
}

impl StackMapFrame {
    fn parse(reader: &mut ByteReader) -> Result<Self> {
        let frame_type = reader.u1()?;
        Ok(match frame_type {
            0..=63 => StackMapFrame::Same {
                offset_delta: frame_type as u2,
            },
            64..=127 => StackMapFrame::SameLocals1StackItem {
                offset_delta: (frame_type - 64) as u2,
                stack: VerificationTypeInfo::parse(reader)?,
            },
            247 => StackMapFrame::SameLocals1StackItem {
                offset_delta: reader.u2()?,
                stack: VerificationTypeInfo::parse(reader)?,
            },
            248..=250 => StackMapFrame::Chop {
                offset_delta: reader.u2()?,
                k: 251 - frame_type,
            },
            251 => StackMapFrame::SameExtended {
                offset_delta: reader.u2()?,
            },
            252..=254 => {
                let offset_delta = reader.u2()?;
                let k = frame_type - 251;
                let mut locals = Vec::with_capacity(k as usize);
                for _ in 0..k {
                    locals.push(VerificationTypeInfo::parse(reader)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = reader.u2()?;
                let locals_count = reader.u2()?;
                let locals = (0..locals_count)
                    .map(|_| VerificationTypeInfo::parse(reader))
                    .collect::<Result<Vec<_>>>()?;
                let stack_count = reader.u2()?;
                let stack = (0..stack_count)
                    .map(|_| VerificationTypeInfo::parse(reader))
                    .collect::<Result<Vec<_>>>()?;
                StackMapFrame::Full {
                    offset_delta,
                    locals,
                    stack,
                }
            }
            other => return Err(ParseError::InvalidStackMapFrameType(other)),
        })
    }
}

/// A typed, resolved attribute. Attribute names not in this list are
/// carried as [`Attribute::Other`] rather than rejected outright —
/// annotation-processor-only and vendor attributes are common in the
/// wild and shouldn't fail an otherwise well-formed class.
#[derive(Debug, Clone)]
pub enum Attribute {
    ConstantValue { index: u2 },
    Code {
        max_stack: u2,
        max_locals: u2,
        code: Vec<u1>,
        exception_table: Vec<ExceptionTableEntry>,
        /// Kept raw until [`Attribute::resolve_nested_code_attributes`]
        /// runs, since resolving a name requires the enclosing
        /// class's constant pool, which isn't available mid-parse.
        raw_attributes: Vec<RawAttribute>,
        attributes: Vec<Attribute>,
    },
    StackMapTable(Vec<StackMapFrame>),
    Exceptions(Vec<u2>),
    InnerClasses(Vec<InnerClassEntry>),
    EnclosingMethod { class_index: u2, method_index: u2 },
    Synthetic,
    Signature { index: u2 },
    SourceFile { index: u2 },
    SourceDebugExtension(Vec<u1>),
    LineNumberTable(Vec<LineNumberEntry>),
    LocalVariableTable(Vec<LocalVariableEntry>),
    LocalVariableTypeTable(Vec<LocalVariableEntry>),
    Deprecated,
    BootstrapMethods(Vec<BootstrapMethodEntry>),
    Other { name: String, content: Vec<u1> },
}

impl Attribute {
    fn parse_known(name: &str, reader: &mut ByteReader) -> Result<Self> {
        Ok(match name {
            "ConstantValue" => Attribute::ConstantValue { index: reader.u2()? },
            "Code" => {
                let max_stack = reader.u2()?;
                let max_locals = reader.u2()?;
                let code_length = reader.u4()? as usize;
                let code = reader.bytes(code_length)?;
                let exception_table_length = reader.u2()?;
                let mut exception_table = Vec::with_capacity(exception_table_length as usize);
                for _ in 0..exception_table_length {
                    exception_table.push(ExceptionTableEntry::parse(reader)?);
                }
                let attributes_count = reader.u2()?;
                let mut raw_attributes = Vec::with_capacity(attributes_count as usize);
                for _ in 0..attributes_count {
                    raw_attributes.push(RawAttribute::parse(reader)?);
                }
                Attribute::Code {
                    max_stack,
                    max_locals,
                    code,
                    exception_table,
                    raw_attributes,
                    attributes: Vec::new(),
                }
            }
            "StackMapTable" => {
                let count = reader.u2()?;
                let frames = (0..count)
                    .map(|_| StackMapFrame::parse(reader))
                    .collect::<Result<Vec<_>>>()?;
                Attribute::StackMapTable(frames)
            }
            "Exceptions" => {
                let count = reader.u2()?;
                let indices = (0..count).map(|_| reader.u2()).collect::<Result<Vec<_>>>()?;
                Attribute::Exceptions(indices)
            }
            "InnerClasses" => {
                let count = reader.u2()?;
                let mut classes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    classes.push(InnerClassEntry {
                        inner_class_info_index: reader.u2()?,
                        outer_class_info_index: reader.u2()?,
                        inner_class_name_index: reader.u2()?,
                        inner_class_access_flags: reader.u2()?,
                    });
                }
                Attribute::InnerClasses(classes)
            }
            "EnclosingMethod" => Attribute::EnclosingMethod {
                class_index: reader.u2()?,
                method_index: reader.u2()?,
            },
            "Synthetic" => Attribute::Synthetic,
            "Signature" => Attribute::Signature { index: reader.u2()? },
            "SourceFile" => Attribute::SourceFile { index: reader.u2()? },
            "SourceDebugExtension" => Attribute::SourceDebugExtension(reader.remaining().to_vec()),
            "LineNumberTable" => {
                let count = reader.u2()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(LineNumberEntry {
                        start_pc: reader.u2()?,
                        line_number: reader.u2()?,
                    });
                }
                Attribute::LineNumberTable(entries)
            }
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                let count = reader.u2()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(LocalVariableEntry {
                        start_pc: reader.u2()?,
                        length: reader.u2()?,
                        name_index: reader.u2()?,
                        descriptor_or_signature_index: reader.u2()?,
                        index: reader.u2()?,
                    });
                }
                if name == "LocalVariableTable" {
                    Attribute::LocalVariableTable(entries)
                } else {
                    Attribute::LocalVariableTypeTable(entries)
                }
            }
            "Deprecated" => Attribute::Deprecated,
            "BootstrapMethods" => {
                let count = reader.u2()?;
                let mut methods = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let bootstrap_method_ref = reader.u2()?;
                    let arg_count = reader.u2()?;
                    let bootstrap_arguments =
                        (0..arg_count).map(|_| reader.u2()).collect::<Result<Vec<_>>>()?;
                    methods.push(BootstrapMethodEntry {
                        bootstrap_method_ref,
                        bootstrap_arguments,
                    });
                }
                Attribute::BootstrapMethods(methods)
            }
            // Annotation attributes and anything else unrecognised
            // are kept verbatim: this VM never reflects on them, but
            // dropping them silently would make `cs_class_printer`'s
            // dumps lie about what the class file actually contains.
            other => Attribute::Other {
                name: other.to_string(),
                content: reader.remaining().to_vec(),
            },
        })
    }

    /// Re-resolves the placeholder `Other` entries produced while
    /// parsing a `Code` attribute's nested attributes, now that the
    /// enclosing constant pool is available.
    pub fn resolve_nested_code_attributes(&mut self, pool: &ConstantPool) -> Result<()> {
        if let Attribute::Code {
            raw_attributes,
            attributes,
            ..
        } = self
        {
            *attributes = raw_attributes
                .iter()
                .map(|raw| raw.resolve(pool))
                .collect::<Result<Vec<_>>>()?;
            raw_attributes.clear();
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Attribute::ConstantValue { .. } => "ConstantValue",
            Attribute::Code { .. } => "Code",
            Attribute::StackMapTable(_) => "StackMapTable",
            Attribute::Exceptions(_) => "Exceptions",
            Attribute::InnerClasses(_) => "InnerClasses",
            Attribute::EnclosingMethod { .. } => "EnclosingMethod",
            Attribute::Synthetic => "Synthetic",
            Attribute::Signature { .. } => "Signature",
            Attribute::SourceFile { .. } => "SourceFile",
            Attribute::SourceDebugExtension(_) => "SourceDebugExtension",
            Attribute::LineNumberTable(_) => "LineNumberTable",
            Attribute::LocalVariableTable(_) => "LocalVariableTable",
            Attribute::LocalVariableTypeTable(_) => "LocalVariableTypeTable",
            Attribute::Deprecated => "Deprecated",
            Attribute::BootstrapMethods(_) => "BootstrapMethods",
            Attribute::Other { .. } => "Other",
        }
    }

    pub fn line_number_for_pc(&self, pc: u4) -> Option<u2> {
        let Attribute::Code { attributes, .. } = self else {
            return None;
        };
        attributes.iter().find_map(|a| match a {
            Attribute::LineNumberTable(entries) => entries
                .iter()
                .filter(|e| e.start_pc as u4 <= pc)
                .max_by_key(|e| e.start_pc)
                .map(|e| e.line_number),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_number_table() {
        let mut data = Vec::new();
        data.extend(2u16.to_be_bytes()); // count
        data.extend(0u16.to_be_bytes());
        data.extend(10u16.to_be_bytes());
        data.extend(5u16.to_be_bytes());
        data.extend(11u16.to_be_bytes());
        let mut reader = ByteReader::new(&data);
        let attr = Attribute::parse_known("LineNumberTable", &mut reader).unwrap();
        match attr {
            Attribute::LineNumberTable(entries) => assert_eq!(entries.len(), 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn switch_alignment_is_reader_responsibility() {
        let mut reader = ByteReader::new(&[0u8; 10]);
        reader.skip(1);
        reader.align_from(0);
        assert_eq!(reader.position(), 4);
    }
}
