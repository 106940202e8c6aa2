//! The closed value type stored in documents.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::decimal128::Decimal128;
use super::oid::ObjectId;
use super::spec::{BinarySubtype, ElementType};
use super::Document;

/// One variant per supported element kind. Exhaustive matching over this enum
/// replaces the runtime type switches of dynamically typed representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary(Binary),
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(DateTime),
    Null,
    RegularExpression(Regex),
    JavaScriptCode(String),
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Decimal128(Decimal128),
    MinKey,
    MaxKey,
}

/// Binary blob plus subtype tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

/// A regular expression: pattern plus option letters. Options are stored
/// sorted, matching the canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

impl Regex {
    pub fn new(pattern: impl Into<String>, options: impl Into<String>) -> Regex {
        let mut chars: Vec<char> = options.into().chars().collect();
        chars.sort_unstable();
        Regex {
            pattern: pattern.into(),
            options: chars.into_iter().collect(),
        }
    }
}

/// Code with a scope document of bound variables.
#[derive(Debug, Clone, PartialEq)]
pub struct JavaScriptCodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// The internal (logical-clock, counter) timestamp pair. Distinct from
/// `DateTime`, which is wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

/// UTC instant with millisecond precision, as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime(i64);

impl DateTime {
    pub fn now() -> DateTime {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        DateTime(millis)
    }

    pub fn from_millis(millis: i64) -> DateTime {
        DateTime(millis)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.0 >= 0 {
            UNIX_EPOCH + Duration::from_millis(self.0 as u64)
        } else {
            UNIX_EPOCH - Duration::from_millis(self.0.unsigned_abs())
        }
    }
}

impl fmt::Debug for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DateTime({}ms)", self.0)
    }
}

impl Bson {
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(_) => ElementType::Double,
            Bson::String(_) => ElementType::String,
            Bson::Document(_) => ElementType::EmbeddedDocument,
            Bson::Array(_) => ElementType::Array,
            Bson::Binary(_) => ElementType::Binary,
            Bson::ObjectId(_) => ElementType::ObjectId,
            Bson::Boolean(_) => ElementType::Boolean,
            Bson::DateTime(_) => ElementType::DateTime,
            Bson::Null => ElementType::Null,
            Bson::RegularExpression(_) => ElementType::RegularExpression,
            Bson::JavaScriptCode(_) => ElementType::JavaScriptCode,
            Bson::JavaScriptCodeWithScope(_) => ElementType::JavaScriptCodeWithScope,
            Bson::Int32(_) => ElementType::Int32,
            Bson::Timestamp(_) => ElementType::Timestamp,
            Bson::Int64(_) => ElementType::Int64,
            Bson::Decimal128(_) => ElementType::Decimal128,
            Bson::MinKey => ElementType::MinKey,
            Bson::MaxKey => ElementType::MaxKey,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Bson>> {
        match self {
            Bson::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Bson::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<&ObjectId> {
        match self {
            Bson::ObjectId(id) => Some(id),
            _ => None,
        }
    }

    /// Numeric reading used where the servers answer with any of int32,
    /// int64 or double for count-like fields. This is a convenience for
    /// callers; structural equality stays type-aware.
    pub fn as_numeric_i64(&self) -> Option<i64> {
        match self {
            Bson::Int32(v) => Some(*v as i64),
            Bson::Int64(v) => Some(*v),
            Bson::Double(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl From<f64> for Bson {
    fn from(v: f64) -> Bson {
        Bson::Double(v)
    }
}

impl From<&str> for Bson {
    fn from(v: &str) -> Bson {
        Bson::String(v.to_string())
    }
}

impl From<&String> for Bson {
    fn from(v: &String) -> Bson {
        Bson::String(v.clone())
    }
}

impl From<String> for Bson {
    fn from(v: String) -> Bson {
        Bson::String(v)
    }
}

impl From<Document> for Bson {
    fn from(v: Document) -> Bson {
        Bson::Document(v)
    }
}

impl From<bool> for Bson {
    fn from(v: bool) -> Bson {
        Bson::Boolean(v)
    }
}

impl From<i32> for Bson {
    fn from(v: i32) -> Bson {
        Bson::Int32(v)
    }
}

impl From<i64> for Bson {
    fn from(v: i64) -> Bson {
        Bson::Int64(v)
    }
}

impl From<ObjectId> for Bson {
    fn from(v: ObjectId) -> Bson {
        Bson::ObjectId(v)
    }
}

impl From<DateTime> for Bson {
    fn from(v: DateTime) -> Bson {
        Bson::DateTime(v)
    }
}

impl From<Timestamp> for Bson {
    fn from(v: Timestamp) -> Bson {
        Bson::Timestamp(v)
    }
}

impl From<Decimal128> for Bson {
    fn from(v: Decimal128) -> Bson {
        Bson::Decimal128(v)
    }
}

impl From<Binary> for Bson {
    fn from(v: Binary) -> Bson {
        Bson::Binary(v)
    }
}

impl From<Regex> for Bson {
    fn from(v: Regex) -> Bson {
        Bson::RegularExpression(v)
    }
}

impl From<JavaScriptCodeWithScope> for Bson {
    fn from(v: JavaScriptCodeWithScope) -> Bson {
        Bson::JavaScriptCodeWithScope(v)
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(v: Vec<T>) -> Bson {
        Bson::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(v: Option<T>) -> Bson {
        match v {
            Some(v) => v.into(),
            None => Bson::Null,
        }
    }
}
