//! The binary document data model: an ordered, typed key/value container
//! with a canonical byte encoding.
//!
//! `Document::to_vec` and `Document::from_slice` are exact inverses; decoding
//! rejects truncated or mismatched-length buffers with
//! `Error::MalformedDocument` and never reads out of bounds.

pub mod decimal128;
pub mod json;
mod macros;
pub mod oid;
pub mod spec;
mod value;

pub use self::decimal128::Decimal128;
pub use self::oid::ObjectId;
pub use self::value::{Binary, Bson, DateTime, JavaScriptCodeWithScope, Regex, Timestamp};
pub use crate::doc;

use self::spec::ElementType;
use crate::error::{Error, Result};

/// Error returned by the typed field accessors.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueAccessError {
    #[error("field is not present")]
    NotPresent,
    #[error("field has a different type")]
    UnexpectedType,
}

type AccessResult<T> = std::result::Result<T, ValueAccessError>;

/// An ordered sequence of (name, value) pairs.
///
/// Names need not be unique; `get` and the typed accessors return the first
/// matching element, and `insert` replaces the first match in place so a
/// replaced key keeps its position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub fn new() -> Document {
        Document {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace the first element named `key` in place, preserving its
    /// position, or append a new element. Returns the replaced value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Remove and return the first element named `key`.
    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get_str(&self, key: &str) -> AccessResult<&str> {
        self.access(key, Bson::as_str)
    }

    pub fn get_i32(&self, key: &str) -> AccessResult<i32> {
        self.access(key, Bson::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> AccessResult<i64> {
        self.access(key, Bson::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> AccessResult<f64> {
        self.access(key, Bson::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> AccessResult<bool> {
        self.access(key, Bson::as_bool)
    }

    pub fn get_document(&self, key: &str) -> AccessResult<&Document> {
        self.access(key, Bson::as_document)
    }

    pub fn get_array(&self, key: &str) -> AccessResult<&Vec<Bson>> {
        self.access(key, Bson::as_array)
    }

    pub fn get_object_id(&self, key: &str) -> AccessResult<ObjectId> {
        self.access(key, |v| v.as_object_id().copied())
    }

    pub fn get_datetime(&self, key: &str) -> AccessResult<DateTime> {
        self.access(key, |v| match v {
            Bson::DateTime(dt) => Some(*dt),
            _ => None,
        })
    }

    pub fn get_binary_generic(&self, key: &str) -> AccessResult<&Vec<u8>> {
        self.access(key, |v| match v {
            Bson::Binary(b) if b.subtype == spec::BinarySubtype::Generic => Some(&b.bytes),
            _ => None,
        })
    }

    fn access<'a, T, F>(&'a self, key: &str, f: F) -> AccessResult<T>
    where
        F: FnOnce(&'a Bson) -> Option<T>,
    {
        let value = self.get(key).ok_or(ValueAccessError::NotPresent)?;
        f(value).ok_or(ValueAccessError::UnexpectedType)
    }

    /// True when the keys are exactly the contiguous sequence `"0".."n-1"`.
    pub fn is_array_shaped(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, (k, _))| *k == i.to_string())
    }

    /// Convert into the element sequence when array-shaped, handing the
    /// document back otherwise.
    pub fn into_array(self) -> std::result::Result<Vec<Bson>, Document> {
        if self.is_array_shaped() {
            Ok(self.entries.into_iter().map(|(_, v)| v).collect())
        } else {
            Err(self)
        }
    }

    /// Encode into the canonical binary form.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        for (name, value) in &self.entries {
            write_element(buf, name, value)?;
        }
        buf.push(0);
        // The total length is only known once the body is built.
        let total = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    /// Decode from an exact buffer. The declared length must match
    /// `bytes.len()` precisely.
    pub fn from_slice(bytes: &[u8]) -> Result<Document> {
        let mut reader = Reader::new(bytes);
        let doc = read_document(&mut reader)?;
        if reader.pos != bytes.len() {
            return Err(Error::MalformedDocument(format!(
                "{} trailing bytes after document",
                bytes.len() - reader.pos
            )));
        }
        Ok(doc)
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Bson)>>(iter: I) -> Document {
        Document {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Wrap an element sequence as an array-shaped document.
pub(crate) fn array_to_document(values: &[Bson]) -> Document {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (i.to_string(), v.clone()))
        .collect()
}

fn write_element(buf: &mut Vec<u8>, name: &str, value: &Bson) -> Result<()> {
    buf.push(value.element_type() as u8);
    write_cstring(buf, name)?;
    match value {
        Bson::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::String(s) => write_string(buf, s),
        Bson::Document(d) => d.write_to(buf)?,
        Bson::Array(values) => array_to_document(values).write_to(buf)?,
        Bson::Binary(b) => {
            buf.extend_from_slice(&(b.bytes.len() as i32).to_le_bytes());
            buf.push(u8::from(b.subtype));
            buf.extend_from_slice(&b.bytes);
        }
        Bson::ObjectId(id) => buf.extend_from_slice(&id.bytes()),
        Bson::Boolean(v) => buf.push(*v as u8),
        Bson::DateTime(dt) => buf.extend_from_slice(&dt.timestamp_millis().to_le_bytes()),
        Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::RegularExpression(re) => {
            write_cstring(buf, &re.pattern)?;
            write_cstring(buf, &re.options)?;
        }
        Bson::JavaScriptCode(code) => write_string(buf, code),
        Bson::JavaScriptCodeWithScope(cws) => {
            let mut body = Vec::new();
            write_string(&mut body, &cws.code);
            cws.scope.write_to(&mut body)?;
            buf.extend_from_slice(&((body.len() + 4) as i32).to_le_bytes());
            buf.extend_from_slice(&body);
        }
        Bson::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::Timestamp(ts) => {
            buf.extend_from_slice(&ts.increment.to_le_bytes());
            buf.extend_from_slice(&ts.time.to_le_bytes());
        }
        Bson::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Bson::Decimal128(d) => buf.extend_from_slice(&d.bytes()),
    }
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::MalformedDocument(format!(
            "interior NUL in element name or pattern: {:?}",
            s
        )));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn truncated(&self) -> Error {
        Error::MalformedDocument(format!("truncated at offset {}", self.pos))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(self.truncated());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_cstring(&mut self) -> Result<&'a str> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| self.truncated())?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| {
            Error::MalformedDocument(format!("invalid UTF-8 at offset {}", self.pos))
        })?;
        self.pos += nul + 1;
        Ok(s)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(Error::MalformedDocument(format!(
                "invalid string length {} at offset {}",
                len,
                self.pos - 4
            )));
        }
        let bytes = self.take(len as usize)?;
        let (body, terminator) = bytes.split_at(len as usize - 1);
        if terminator != [0] {
            return Err(Error::MalformedDocument(format!(
                "string missing NUL terminator at offset {}",
                self.pos - 1
            )));
        }
        let s = std::str::from_utf8(body).map_err(|_| {
            Error::MalformedDocument(format!("invalid UTF-8 at offset {}", self.pos))
        })?;
        Ok(s.to_string())
    }
}

fn read_document(reader: &mut Reader<'_>) -> Result<Document> {
    let start = reader.pos;
    let declared = reader.read_i32()?;
    if declared < 5 {
        return Err(Error::MalformedDocument(format!(
            "document length {} too small",
            declared
        )));
    }
    if reader.buf.len() - start < declared as usize {
        return Err(Error::MalformedDocument(format!(
            "document length {} exceeds available {} bytes",
            declared,
            reader.buf.len() - start
        )));
    }
    let end = start + declared as usize;

    let mut doc = Document::new();
    loop {
        let tag = reader.read_u8()?;
        if tag == 0 {
            if reader.pos != end {
                return Err(Error::MalformedDocument(format!(
                    "document length mismatch: declared {}, consumed {}",
                    declared,
                    reader.pos - start
                )));
            }
            return Ok(doc);
        }
        if reader.pos >= end {
            return Err(Error::MalformedDocument(
                "document missing terminator".to_string(),
            ));
        }
        let element_type = ElementType::from_u8(tag).ok_or_else(|| {
            Error::MalformedDocument(format!("unknown element type 0x{:02X}", tag))
        })?;
        let name = reader.read_cstring()?.to_string();
        let value = read_value(reader, element_type)?;
        doc.entries.push((name, value));
    }
}

fn read_value(reader: &mut Reader<'_>, element_type: ElementType) -> Result<Bson> {
    Ok(match element_type {
        ElementType::Double => Bson::Double(reader.read_f64()?),
        ElementType::String => Bson::String(reader.read_string()?),
        ElementType::EmbeddedDocument => Bson::Document(read_document(reader)?),
        ElementType::Array => {
            let doc = read_document(reader)?;
            match doc.into_array() {
                Ok(values) => Bson::Array(values),
                Err(_) => {
                    return Err(Error::MalformedDocument(
                        "array element keys are not the contiguous sequence 0..n-1".to_string(),
                    ));
                }
            }
        }
        ElementType::Binary => {
            let len = reader.read_i32()?;
            if len < 0 {
                return Err(Error::MalformedDocument(format!(
                    "negative binary length {}",
                    len
                )));
            }
            let subtype = spec::BinarySubtype::from(reader.read_u8()?);
            let bytes = reader.take(len as usize)?.to_vec();
            Bson::Binary(Binary { subtype, bytes })
        }
        ElementType::ObjectId => {
            let bytes: [u8; 12] = reader.take(12)?.try_into().unwrap();
            Bson::ObjectId(ObjectId::from_bytes(bytes))
        }
        ElementType::Boolean => match reader.read_u8()? {
            0 => Bson::Boolean(false),
            1 => Bson::Boolean(true),
            other => {
                return Err(Error::MalformedDocument(format!(
                    "invalid boolean byte 0x{:02X}",
                    other
                )));
            }
        },
        ElementType::DateTime => Bson::DateTime(DateTime::from_millis(reader.read_i64()?)),
        ElementType::Null => Bson::Null,
        ElementType::RegularExpression => {
            let pattern = reader.read_cstring()?.to_string();
            let options = reader.read_cstring()?.to_string();
            Bson::RegularExpression(Regex { pattern, options })
        }
        ElementType::JavaScriptCode => Bson::JavaScriptCode(reader.read_string()?),
        ElementType::JavaScriptCodeWithScope => {
            let start = reader.pos;
            let declared = reader.read_i32()?;
            let code = reader.read_string()?;
            let scope = read_document(reader)?;
            if reader.pos - start != declared as usize {
                return Err(Error::MalformedDocument(format!(
                    "code-with-scope length mismatch: declared {}, consumed {}",
                    declared,
                    reader.pos - start
                )));
            }
            Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope { code, scope })
        }
        ElementType::Int32 => Bson::Int32(reader.read_i32()?),
        ElementType::Timestamp => {
            let increment = reader.read_u32()?;
            let time = reader.read_u32()?;
            Bson::Timestamp(Timestamp { time, increment })
        }
        ElementType::Int64 => Bson::Int64(reader.read_i64()?),
        ElementType::Decimal128 => {
            let bytes: [u8; 16] = reader.take(16)?.try_into().unwrap();
            Bson::Decimal128(Decimal128::from_bytes(bytes))
        }
        ElementType::MinKey => Bson::MinKey,
        ElementType::MaxKey => Bson::MaxKey,
    })
}
