//! Bidirectional mapping between documents and a generic JSON tree.
//!
//! Kinds without a native JSON equivalent are wrapped in single-key marker
//! objects (`$oid`, `$binary`, `$date`, ...) and recognized back on decode.
//! Int64 goes through `$numberLong` so large values survive the round trip.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::{Map, Number, Value, json};

use super::spec::BinarySubtype;
use super::{
    Binary, Bson, DateTime, Decimal128, Document, JavaScriptCodeWithScope, ObjectId, Regex,
    Timestamp,
};
use crate::error::{Error, Result};

pub fn document_to_json(doc: &Document) -> Value {
    let mut map = Map::new();
    for (key, value) in doc.iter() {
        map.insert(key.to_string(), bson_to_json(value));
    }
    Value::Object(map)
}

pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(v) if v.is_finite() => json!(v),
        Bson::Double(v) => {
            let rendered = if v.is_nan() {
                "NaN"
            } else if *v > 0.0 {
                "Infinity"
            } else {
                "-Infinity"
            };
            json!({"$numberDouble": rendered})
        }
        Bson::String(s) => Value::String(s.clone()),
        Bson::Document(d) => document_to_json(d),
        Bson::Array(values) => Value::Array(values.iter().map(bson_to_json).collect()),
        Bson::Binary(b) => json!({
            "$binary": {
                "base64": BASE64.encode(&b.bytes),
                "subType": format!("{:02x}", u8::from(b.subtype)),
            }
        }),
        Bson::ObjectId(id) => json!({"$oid": id.to_hex()}),
        Bson::Boolean(v) => Value::Bool(*v),
        Bson::DateTime(dt) => json!({
            "$date": {"$numberLong": dt.timestamp_millis().to_string()}
        }),
        Bson::Null => Value::Null,
        Bson::RegularExpression(re) => json!({
            "$regularExpression": {"pattern": re.pattern, "options": re.options}
        }),
        Bson::JavaScriptCode(code) => json!({"$code": code}),
        Bson::JavaScriptCodeWithScope(cws) => json!({
            "$code": cws.code,
            "$scope": document_to_json(&cws.scope),
        }),
        Bson::Int32(v) => json!(v),
        Bson::Timestamp(ts) => json!({
            "$timestamp": {"t": ts.time, "i": ts.increment}
        }),
        Bson::Int64(v) => json!({"$numberLong": v.to_string()}),
        Bson::Decimal128(d) => json!({"$numberDecimal": d.to_string()}),
        Bson::MinKey => json!({"$minKey": 1}),
        Bson::MaxKey => json!({"$maxKey": 1}),
    }
}

pub fn document_from_json(value: &Value) -> Result<Document> {
    match value {
        Value::Object(map) => {
            let mut doc = Document::new();
            for (key, value) in map {
                doc.insert(key.clone(), json_to_bson(value)?);
            }
            Ok(doc)
        }
        other => Err(bad_json(format_args!("expected object, got {}", other))),
    }
}

pub fn json_to_bson(value: &Value) -> Result<Bson> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(v) => Bson::Boolean(*v),
        Value::Number(n) => number_to_bson(n)?,
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(values) => Bson::Array(
            values
                .iter()
                .map(json_to_bson)
                .collect::<Result<Vec<Bson>>>()?,
        ),
        Value::Object(map) => match decode_wrapper(map)? {
            Some(wrapped) => wrapped,
            None => Bson::Document(document_from_json(value)?),
        },
    })
}

fn number_to_bson(n: &Number) -> Result<Bson> {
    if let Some(v) = n.as_i64() {
        if let Ok(v) = i32::try_from(v) {
            return Ok(Bson::Int32(v));
        }
        return Ok(Bson::Int64(v));
    }
    n.as_f64()
        .map(Bson::Double)
        .ok_or_else(|| bad_json(format_args!("unrepresentable number {}", n)))
}

/// Recognize the fixed marker keys. Returns `None` for plain objects.
fn decode_wrapper(map: &Map<String, Value>) -> Result<Option<Bson>> {
    let Some(first) = map.keys().next() else {
        return Ok(None);
    };
    let wrapped = match first.as_str() {
        "$oid" if map.len() == 1 => {
            let hex = expect_str(map, "$oid")?;
            Bson::ObjectId(ObjectId::parse_str(hex)?)
        }
        "$numberLong" if map.len() == 1 => {
            let s = expect_str(map, "$numberLong")?;
            Bson::Int64(
                s.parse()
                    .map_err(|_| bad_json(format_args!("invalid $numberLong {:?}", s)))?,
            )
        }
        "$numberInt" if map.len() == 1 => {
            let s = expect_str(map, "$numberInt")?;
            Bson::Int32(
                s.parse()
                    .map_err(|_| bad_json(format_args!("invalid $numberInt {:?}", s)))?,
            )
        }
        "$numberDouble" if map.len() == 1 => {
            let s = expect_str(map, "$numberDouble")?;
            let v = match s {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                other => other
                    .parse()
                    .map_err(|_| bad_json(format_args!("invalid $numberDouble {:?}", other)))?,
            };
            Bson::Double(v)
        }
        "$numberDecimal" if map.len() == 1 => {
            Bson::Decimal128(Decimal128::parse_str(expect_str(map, "$numberDecimal")?)?)
        }
        "$binary" if map.len() == 1 => {
            let inner = map
                .get("$binary")
                .and_then(Value::as_object)
                .ok_or_else(|| bad_json(format_args!("$binary must hold an object")))?;
            let payload = inner
                .get("base64")
                .and_then(Value::as_str)
                .ok_or_else(|| bad_json(format_args!("$binary missing base64 payload")))?;
            let subtype = inner
                .get("subType")
                .and_then(Value::as_str)
                .ok_or_else(|| bad_json(format_args!("$binary missing subType")))?;
            let bytes = BASE64
                .decode(payload)
                .map_err(|_| bad_json(format_args!("invalid base64 in $binary")))?;
            let subtype = u8::from_str_radix(subtype, 16)
                .map_err(|_| bad_json(format_args!("invalid $binary subType {:?}", subtype)))?;
            Bson::Binary(Binary {
                subtype: BinarySubtype::from(subtype),
                bytes,
            })
        }
        "$date" if map.len() == 1 => {
            let millis = match map.get("$date") {
                Some(Value::Object(inner)) => {
                    let s = inner
                        .get("$numberLong")
                        .and_then(Value::as_str)
                        .ok_or_else(|| bad_json(format_args!("$date missing $numberLong")))?;
                    s.parse()
                        .map_err(|_| bad_json(format_args!("invalid $date millis {:?}", s)))?
                }
                Some(Value::Number(n)) => n
                    .as_i64()
                    .ok_or_else(|| bad_json(format_args!("invalid $date number {}", n)))?,
                other => {
                    return Err(bad_json(format_args!("invalid $date payload {:?}", other)));
                }
            };
            Bson::DateTime(DateTime::from_millis(millis))
        }
        "$regularExpression" if map.len() == 1 => {
            let inner = map
                .get("$regularExpression")
                .and_then(Value::as_object)
                .ok_or_else(|| bad_json(format_args!("$regularExpression must hold an object")))?;
            let pattern = inner.get("pattern").and_then(Value::as_str).unwrap_or("");
            let options = inner.get("options").and_then(Value::as_str).unwrap_or("");
            Bson::RegularExpression(Regex::new(pattern, options))
        }
        "$timestamp" if map.len() == 1 => {
            let inner = map
                .get("$timestamp")
                .and_then(Value::as_object)
                .ok_or_else(|| bad_json(format_args!("$timestamp must hold an object")))?;
            let field = |name: &str| -> Result<u32> {
                inner
                    .get(name)
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| bad_json(format_args!("$timestamp missing field {:?}", name)))
            };
            Bson::Timestamp(Timestamp {
                time: field("t")?,
                increment: field("i")?,
            })
        }
        "$code" => {
            let code = expect_str(map, "$code")?.to_string();
            match (map.len(), map.get("$scope")) {
                (1, None) => Bson::JavaScriptCode(code),
                (2, Some(scope)) => Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
                    code,
                    scope: document_from_json(scope)?,
                }),
                _ => return Ok(None),
            }
        }
        "$minKey" if map.len() == 1 => Bson::MinKey,
        "$maxKey" if map.len() == 1 => Bson::MaxKey,
        _ => return Ok(None),
    };
    Ok(Some(wrapped))
}

fn expect_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_json(format_args!("{} must hold a string", key)))
}

fn bad_json(message: std::fmt::Arguments<'_>) -> Error {
    Error::MalformedDocument(message.to_string())
}

impl serde::Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        document_to_json(self).serialize(serializer)
    }
}

impl serde::Serialize for Bson {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        bson_to_json(self).serialize(serializer)
    }
}
