//! Pulls named, typed fields out of an event payload.
//!
//! Properties are laid out back to back in the payload; the size of each one
//! is derived from its schema descriptor, and for strings possibly from the
//! payload itself. The parser walks properties front to back on demand and
//! caches the located slices, so asking for the last field prices in the
//! sizing of everything before it exactly once.

use thiserror::Error;
use uuid::Uuid;

use crate::prop_types::{InType, PropertyCount, PropertyDesc, PropertyFlags, PropertyLength};
use crate::property::PropertyInfo;
use crate::schema::TypedEvent;
use crate::utils;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("unknown property {0}")]
    UnknownProperty(String),
    #[error("property has an incompatible type")]
    InvalidType,
    #[error("stored field is wider than the requested type")]
    WidthMismatch,
    #[error("property data extends past the end of the payload")]
    OutOfBounds,
    #[error("array index {0} is out of range")]
    IndexOutOfRange(usize),
    #[error("cannot determine size of property {0}")]
    UnknownSize(String),
    #[error("unsupported property encoding: {0}")]
    Unsupported(&'static str),
}

type ParserResult<T> = Result<T, ParserError>;

/// Implemented by every type the parser can produce from a named property.
pub trait TryParse<T> {
    fn try_parse(&mut self, name: &str) -> ParserResult<T>;

    /// Panicking convenience for contexts where the schema is known good.
    fn parse(&mut self, name: &str) -> T {
        self.try_parse(name)
            .unwrap_or_else(|e| panic!("{:?} parsing {} as {}", e, name, std::any::type_name::<T>()))
    }
}

/// Pointer-sized payload field; width follows the logging process.
#[derive(Debug, Clone, Copy)]
pub enum Address {
    Address64(u64),
    Address32(u32),
}

impl Address {
    pub fn as_u64(&self) -> u64 {
        match self {
            Address::Address64(a) => *a,
            Address::Address32(a) => *a as u64,
        }
    }
}

pub struct Parser<'a> {
    event: &'a TypedEvent<'a>,
    /// Remaining payload past the last located property.
    pub buffer: &'a [u8],
    offset: usize,
    cache: Vec<PropertyInfo<'a>>,
}

impl<'a> Parser<'a> {
    pub fn create(event: &'a TypedEvent<'a>) -> Self {
        Parser {
            event,
            buffer: event.user_buffer(),
            offset: 0,
            cache: Vec::new(),
        }
    }

    /// Value of an already-located property, zero-extended. Used to resolve
    /// length/count references to earlier fields.
    fn cached_field_value(&self, index: u16) -> ParserResult<u64> {
        let info = self
            .cache
            .get(index as usize)
            .ok_or(ParserError::InvalidType)?;
        read_zero_extended(info.buffer)
    }

    /// Size in bytes of one element of a primitive property whose data
    /// starts at `at`.
    fn primitive_element_size(
        &self,
        in_type: InType,
        length: PropertyLength,
        flags: PropertyFlags,
        count: usize,
        at: &[u8],
    ) -> ParserResult<usize> {
        match length {
            PropertyLength::FromField(index) => {
                let n = self.cached_field_value(index)? as usize;
                Ok(match in_type {
                    InType::UnicodeString => n * 2,
                    _ => n,
                })
            }
            PropertyLength::Fixed(len) => {
                if flags.is_empty() && len > 0 && count == 1 {
                    return Ok(len as usize);
                }
                if let Some(size) = in_type.fixed_size() {
                    return Ok(size);
                }
                match in_type {
                    InType::Pointer | InType::SizeT => Ok(self.event.pointer_size()),
                    InType::UnicodeString => {
                        if len > 0 {
                            Ok(len as usize)
                        } else {
                            Ok(utils::null_utf16_size(at))
                        }
                    }
                    InType::AnsiString => {
                        if len > 0 {
                            Ok(len as usize)
                        } else {
                            Ok(utils::null_ansi_size(at))
                        }
                    }
                    InType::Binary => Ok(len as usize),
                    InType::Sid => Err(ParserError::Unsupported("SID properties")),
                    _ => {
                        if len > 0 {
                            Ok(len as usize)
                        } else {
                            Err(ParserError::UnknownSize(String::new()))
                        }
                    }
                }
            }
        }
    }

    /// Size of one element of `property`, with its data starting at `at`.
    /// Struct properties sum their members, walking a local cursor so
    /// variable-width members inside the struct size correctly.
    fn element_size(&self, index: usize, at: &[u8]) -> ParserResult<usize> {
        let properties = self.event.properties();
        let property = properties
            .property(index)
            .ok_or(ParserError::InvalidType)?;
        match &property.desc {
            PropertyDesc::Primitive(desc) => {
                let count = match property.count {
                    PropertyCount::Fixed(n) => n as usize,
                    PropertyCount::FromField(field) => self.cached_field_value(field)? as usize,
                };
                self.primitive_element_size(
                    desc.in_type,
                    property.length,
                    property.flags & !PropertyFlags::PARAM_FIXED_COUNT,
                    count,
                    at,
                )
            }
            PropertyDesc::Struct(desc) => {
                let mut total = 0usize;
                for m in 0..desc.num_members as usize {
                    let member_index = desc.start_index as usize + m;
                    let member = properties
                        .property(member_index)
                        .ok_or(ParserError::InvalidType)?;
                    let member_count = match member.count {
                        PropertyCount::Fixed(n) => n as usize,
                        PropertyCount::FromField(field) => {
                            self.cached_field_value(field)? as usize
                        }
                    };
                    let rest = at.get(total..).unwrap_or(&[]);
                    let member_size = self.element_size(member_index, rest)?;
                    total += member_size * member_count;
                }
                Ok(total)
            }
        }
    }

    /// Locates the named property, walking and caching everything up to it.
    pub fn find_property(&mut self, name: &str) -> ParserResult<usize> {
        let index = self
            .event
            .properties()
            .index_of(name)
            .ok_or_else(|| ParserError::UnknownProperty(name.to_string()))?;
        if index < self.cache.len() {
            return Ok(index);
        }

        for i in self.cache.len()..=index {
            let count = {
                let property = self
                    .event
                    .properties()
                    .property(i)
                    .ok_or(ParserError::InvalidType)?;
                match property.count {
                    PropertyCount::Fixed(n) => n as usize,
                    PropertyCount::FromField(field) => self.cached_field_value(field)? as usize,
                }
            };
            let elem_size = self.element_size(i, self.buffer).map_err(|e| match e {
                ParserError::UnknownSize(_) => {
                    ParserError::UnknownSize(self.event.properties().property(i).unwrap().name.clone())
                }
                other => other,
            })?;
            let total = elem_size
                .checked_mul(count)
                .ok_or(ParserError::OutOfBounds)?;
            if self.buffer.len() < total {
                return Err(ParserError::OutOfBounds);
            }

            let (prop_buffer, remaining) = self.buffer.split_at(total);
            let property = self.event.properties().property(i).unwrap();
            self.cache.push(PropertyInfo {
                property,
                offset: self.offset,
                buffer: prop_buffer,
                elem_size,
            });
            self.buffer = remaining;
            self.offset += total;
        }
        Ok(index)
    }

    fn element(&self, cache_index: usize, array_index: usize) -> ParserResult<&'a [u8]> {
        let info = &self.cache[cache_index];
        let buffer: &'a [u8] = info.buffer;
        if info.elem_size == 0 {
            if array_index == 0 {
                return Ok(buffer);
            }
            return Err(ParserError::IndexOutOfRange(array_index));
        }
        let start = array_index * info.elem_size;
        let end = start + info.elem_size;
        buffer
            .get(start..end)
            .ok_or(ParserError::IndexOutOfRange(array_index))
    }

    fn primitive_element(
        &mut self,
        name: &str,
        array_index: usize,
    ) -> ParserResult<(InType, &'a [u8])> {
        let index = self.find_property(name)?;
        let info = &self.cache[index];
        let PropertyDesc::Primitive(desc) = &info.property.desc else {
            return Err(ParserError::InvalidType);
        };
        let in_type = desc.in_type;
        let buffer = self.element(index, array_index)?;
        Ok((in_type, buffer))
    }

    /// One element of an array property, zero-extended to `u64`.
    pub fn try_parse_u64_at(&mut self, name: &str, array_index: usize) -> ParserResult<u64> {
        let (in_type, buffer) = self.primitive_element(name, array_index)?;
        if in_type.is_string() {
            return Err(ParserError::InvalidType);
        }
        if buffer.len() > 8 {
            return Err(ParserError::WidthMismatch);
        }
        read_zero_extended(buffer)
    }
}

/// Little-endian read of up to 8 bytes, zero-extending shorter fields.
fn read_zero_extended(buffer: &[u8]) -> ParserResult<u64> {
    if buffer.len() > 8 {
        return Err(ParserError::WidthMismatch);
    }
    let mut bytes = [0u8; 8];
    bytes[..buffer.len()].copy_from_slice(buffer);
    Ok(u64::from_le_bytes(bytes))
}

macro_rules! impl_try_parse_int {
    ($T:ident) => {
        impl TryParse<$T> for Parser<'_> {
            fn try_parse(&mut self, name: &str) -> ParserResult<$T> {
                let (in_type, buffer) = self.primitive_element(name, 0)?;
                if in_type.is_string() {
                    return Err(ParserError::InvalidType);
                }
                if buffer.len() > std::mem::size_of::<$T>() {
                    return Err(ParserError::WidthMismatch);
                }
                Ok(read_zero_extended(buffer)? as $T)
            }
        }
    };
}

impl_try_parse_int!(u8);
impl_try_parse_int!(i8);
impl_try_parse_int!(u16);
impl_try_parse_int!(i16);
impl_try_parse_int!(u32);
impl_try_parse_int!(i32);
impl_try_parse_int!(u64);
impl_try_parse_int!(i64);

impl TryParse<bool> for Parser<'_> {
    fn try_parse(&mut self, name: &str) -> ParserResult<bool> {
        let value: u32 = self.try_parse(name)?;
        Ok(value != 0)
    }
}

impl TryParse<Address> for Parser<'_> {
    fn try_parse(&mut self, name: &str) -> ParserResult<Address> {
        let value: u64 = self.try_parse(name)?;
        if self.event.is_64bit() {
            Ok(Address::Address64(value))
        } else {
            Ok(Address::Address32(value as u32))
        }
    }
}

impl TryParse<String> for Parser<'_> {
    fn try_parse(&mut self, name: &str) -> ParserResult<String> {
        let (in_type, buffer) = self.primitive_element(name, 0)?;
        match in_type {
            InType::UnicodeString => Ok(utils::decode_utf16_string(buffer)),
            InType::AnsiString => Ok(utils::decode_ansi_string(buffer)),
            _ => Err(ParserError::InvalidType),
        }
    }
}

impl TryParse<Uuid> for Parser<'_> {
    fn try_parse(&mut self, name: &str) -> ParserResult<Uuid> {
        let (in_type, buffer) = self.primitive_element(name, 0)?;
        if in_type != InType::Guid || buffer.len() != 16 {
            return Err(ParserError::InvalidType);
        }
        let d1 = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        let d2 = u16::from_le_bytes(buffer[4..6].try_into().unwrap());
        let d3 = u16::from_le_bytes(buffer[6..8].try_into().unwrap());
        let d4: [u8; 8] = buffer[8..16].try_into().unwrap();
        Ok(Uuid::from_fields(d1, d2, d3, &d4))
    }
}

impl TryParse<Vec<u8>> for Parser<'_> {
    fn try_parse(&mut self, name: &str) -> ParserResult<Vec<u8>> {
        let index = self.find_property(name)?;
        Ok(self.cache[index].buffer.to_vec())
    }
}
