//! Wire-level property descriptors.
//!
//! These mirror the in/out type codes used by the OS event-metadata
//! facility, so schemas translated from platform metadata keep their
//! original type codes.

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

/// Storage type of a property in the event payload.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum InType {
    Null,
    UnicodeString,
    AnsiString,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Boolean, // 4 bytes on the wire
    Binary,
    Guid,
    Pointer, // 4 or 8 bytes depending on the logging process
    FileTime,
    SystemTime,
    Sid,
    HexInt32,
    HexInt64,
    SizeT = 31,
}

/// Presentation type; only consulted where it changes decoding.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum OutType {
    #[default]
    Null,
    String,
    DateTime,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Boolean,
    Guid,
    HexBinary,
    HexInt8,
    HexInt16,
    HexInt32,
    HexInt64,
    Pid,
    Tid,
    Port,
    Ipv4,
    Ipv6,
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PropertyFlags: u32 {
        const STRUCT = 0x1;
        const PARAM_LENGTH = 0x2;
        const PARAM_COUNT = 0x4;
        const WBEMXML_FRAGMENT = 0x8;
        const PARAM_FIXED_LENGTH = 0x10;
        const PARAM_FIXED_COUNT = 0x20;
        const HAS_TAGS = 0x40;
        const HAS_CUSTOM_SCHEMA = 0x80;
    }
}

/// Byte length of a property, either fixed or carried by a sibling field
/// earlier in the same event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLength {
    Fixed(u16),
    /// Index of the property whose value is the length, in elements.
    FromField(u16),
}

/// Element count of a property, either fixed or carried by a sibling field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyCount {
    Fixed(u16),
    /// Index of the property whose value is the count.
    FromField(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveDesc {
    pub in_type: InType,
    pub out_type: OutType,
}

/// A structured property covers `num_members` child properties starting at
/// `start_index` in the schema's property array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructDesc {
    pub start_index: u16,
    pub num_members: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyDesc {
    Primitive(PrimitiveDesc),
    Struct(StructDesc),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub flags: PropertyFlags,
    pub length: PropertyLength,
    pub count: PropertyCount,
    pub desc: PropertyDesc,
}

impl Property {
    /// A scalar property whose width follows from its in-type.
    pub fn primitive(name: &str, in_type: InType) -> Self {
        Property {
            name: name.to_string(),
            flags: PropertyFlags::empty(),
            length: PropertyLength::Fixed(in_type.fixed_size().unwrap_or(0) as u16),
            count: PropertyCount::Fixed(1),
            desc: PropertyDesc::Primitive(PrimitiveDesc {
                in_type,
                out_type: OutType::Null,
            }),
        }
    }

    pub fn with_length(mut self, length: PropertyLength) -> Self {
        if let PropertyLength::FromField(_) = length {
            self.flags |= PropertyFlags::PARAM_LENGTH;
        }
        self.length = length;
        self
    }

    pub fn with_count(mut self, count: PropertyCount) -> Self {
        if let PropertyCount::FromField(_) = count {
            self.flags |= PropertyFlags::PARAM_COUNT;
        } else {
            self.flags |= PropertyFlags::PARAM_FIXED_COUNT;
        }
        self.count = count;
        self
    }
}

impl InType {
    /// Wire size for types with a fixed width, `None` for variable ones.
    /// `Pointer`/`SizeT` depend on the event header and are handled by the
    /// parser.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            InType::Int8 | InType::UInt8 => Some(1),
            InType::Int16 | InType::UInt16 => Some(2),
            InType::Int32 | InType::UInt32 | InType::HexInt32 | InType::Float => Some(4),
            InType::Boolean => Some(4),
            InType::Int64 | InType::UInt64 | InType::HexInt64 | InType::Double => Some(8),
            InType::FileTime => Some(8),
            InType::SystemTime => Some(16),
            InType::Guid => Some(16),
            _ => None,
        }
    }

    pub fn is_string(self) -> bool {
        matches!(self, InType::UnicodeString | InType::AnsiString)
    }
}
