//! Element type tags and binary subtypes from the BSON specification.

/// All element types understood by the decoder.
///
/// The deprecated Undefined (0x06), DBPointer (0x0C) and Symbol (0x0E) tags
/// are intentionally absent; decoding them fails as an unknown tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    EmbeddedDocument = 0x03,
    Array = 0x04,
    Binary = 0x05,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    RegularExpression = 0x0B,
    JavaScriptCode = 0x0D,
    JavaScriptCodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    Decimal128 = 0x13,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    pub fn from_u8(tag: u8) -> Option<ElementType> {
        Some(match tag {
            0x01 => ElementType::Double,
            0x02 => ElementType::String,
            0x03 => ElementType::EmbeddedDocument,
            0x04 => ElementType::Array,
            0x05 => ElementType::Binary,
            0x07 => ElementType::ObjectId,
            0x08 => ElementType::Boolean,
            0x09 => ElementType::DateTime,
            0x0A => ElementType::Null,
            0x0B => ElementType::RegularExpression,
            0x0D => ElementType::JavaScriptCode,
            0x0F => ElementType::JavaScriptCodeWithScope,
            0x10 => ElementType::Int32,
            0x11 => ElementType::Timestamp,
            0x12 => ElementType::Int64,
            0x13 => ElementType::Decimal128,
            0x7F => ElementType::MaxKey,
            0xFF => ElementType::MinKey,
            _ => return None,
        })
    }
}

/// Subtype tag carried by binary elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySubtype {
    Generic,
    Function,
    BinaryOld,
    UuidOld,
    Uuid,
    Md5,
    Encrypted,
    Column,
    UserDefined(u8),
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> u8 {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Encrypted => 0x06,
            BinarySubtype::Column => 0x07,
            BinarySubtype::UserDefined(t) => t,
        }
    }
}

impl From<u8> for BinarySubtype {
    fn from(tag: u8) -> BinarySubtype {
        match tag {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidOld,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            0x06 => BinarySubtype::Encrypted,
            0x07 => BinarySubtype::Column,
            t => BinarySubtype::UserDefined(t),
        }
    }
}
