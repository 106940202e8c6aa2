//! Wire protocol framing: message header parsing, OP_MSG / OP_QUERY /
//! OP_REPLY encode/decode, and OP_COMPRESSED handling.
//!
//! The codec is stateless. Framing above it reads exactly `message_length`
//! bytes before handing a body here; partial reads are the transport's
//! problem, never assumed complete by the codec.

pub mod compress;

use bytes::{BufMut, Bytes, BytesMut};

use crate::bson::Document;
use crate::error::{Error, Result};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;

/// Largest frame we are willing to read before the handshake reports the
/// server's own limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: i32 = 48_000_000;

// OP_QUERY flag bits.
pub const QUERY_SECONDARY_OK: u32 = 1 << 2;

// OP_REPLY response flag bits.
pub const REPLY_CURSOR_NOT_FOUND: u32 = 1 << 0;
pub const REPLY_QUERY_FAILURE: u32 = 1 << 1;

// OP_MSG flag bits.
const MSG_CHECKSUM_PRESENT: u32 = 1 << 0;

/// Allocator for the strictly increasing request ids carried in message
/// headers. One instance per client; the single mutation point keeps ids
/// unique across connections until a reply arrives or the waiter times out.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: std::sync::atomic::AtomicI32,
}

impl RequestIds {
    pub fn new() -> RequestIds {
        RequestIds {
            next: std::sync::atomic::AtomicI32::new(1),
        }
    }

    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            HEADER_LEN,
        ))
    }

    /// Body length implied by the header, validated against sane bounds.
    pub fn body_len(&self, max_message_size: i32) -> Result<usize> {
        if self.message_length < HEADER_LEN as i32 || self.message_length > max_message_size {
            return Err(Error::Protocol(format!(
                "invalid message length {}",
                self.message_length
            )));
        }
        Ok(self.message_length as usize - HEADER_LEN)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }
}

/// One parsed server reply, whichever op code carried it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response_to: i32,
    pub flags: u32,
    pub documents: Vec<Document>,
    pub cursor_id: i64,
    pub starting_from: i32,
}

impl Reply {
    /// The single command-reply document (section 0 for OP_MSG, first doc
    /// for OP_REPLY).
    pub fn first_document(&self) -> Result<&Document> {
        self.documents
            .first()
            .ok_or_else(|| Error::Protocol("reply carried no documents".to_string()))
    }
}

/// Encode an OP_MSG with section 0 containing a single document.
/// Returns the full wire message including the header; the total length
/// prefix is written after the body is assembled.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Result<Bytes> {
    let doc_bytes = doc.to_vec()?;
    let flags: u32 = 0;
    let body_len = 4 /*flags*/ + 1 /*kind*/ + doc_bytes.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = BytesMut::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_MSG,
    }
    .put(&mut out);
    out.put_u32_le(flags);
    out.put_u8(0); // section 0
    out.put_slice(&doc_bytes);
    Ok(out.freeze())
}

/// Encode a legacy OP_QUERY (used for the pre-handshake `isMaster` probe).
pub fn encode_op_query(
    query: &Document,
    full_collection_name: &str,
    flags: u32,
    number_to_return: i32,
    request_id: i32,
) -> Result<Bytes> {
    let query_bytes = query.to_vec()?;
    let body_len = 4 + full_collection_name.len() + 1 + 4 + 4 + query_bytes.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = BytesMut::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to: 0,
        op_code: OP_QUERY,
    }
    .put(&mut out);
    out.put_u32_le(flags);
    out.put_slice(full_collection_name.as_bytes());
    out.put_u8(0);
    out.put_i32_le(0); // numberToSkip
    out.put_i32_le(number_to_return);
    out.put_slice(&query_bytes);
    Ok(out.freeze())
}

/// Decode an OP_QUERY body into (flags, fullCollectionName, numberToSkip,
/// numberToReturn, queryDoc). The server side of the handshake.
pub fn decode_op_query(body: &[u8]) -> Result<(u32, String, i32, i32, Document)> {
    let short = || Error::Protocol("OP_QUERY body truncated".to_string());
    if body.len() < 4 {
        return Err(short());
    }
    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let name_end = body[4..]
        .iter()
        .position(|b| *b == 0)
        .map(|i| 4 + i)
        .ok_or_else(short)?;
    let full_collection_name = std::str::from_utf8(&body[4..name_end])
        .map_err(|_| Error::Protocol("invalid UTF-8 in collection name".to_string()))?
        .to_string();
    let mut at = name_end + 1;
    if at + 8 > body.len() {
        return Err(short());
    }
    let number_to_skip = i32::from_le_bytes(body[at..at + 4].try_into().unwrap());
    at += 4;
    let number_to_return = i32::from_le_bytes(body[at..at + 4].try_into().unwrap());
    at += 4;
    let query = Document::from_slice(&body[at..])?;
    Ok((
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
    ))
}

/// Encode an OP_REPLY carrying the provided documents.
pub fn encode_op_reply(
    docs: &[Document],
    flags: u32,
    cursor_id: i64,
    response_to: i32,
    request_id: i32,
) -> Result<Bytes> {
    let mut docs_buf = Vec::new();
    for doc in docs {
        docs_buf.extend_from_slice(&doc.to_vec()?);
    }

    let body_len = 4 + 8 + 4 + 4 + docs_buf.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = BytesMut::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_REPLY,
    }
    .put(&mut out);
    out.put_u32_le(flags);
    out.put_i64_le(cursor_id);
    out.put_i32_le(0); // startingFrom
    out.put_i32_le(docs.len() as i32);
    out.put_slice(&docs_buf);
    Ok(out.freeze())
}

/// Decode OP_MSG section-0 from the provided body bytes.
pub fn decode_op_msg_section0(body: &[u8]) -> Result<(u32, Document)> {
    if body.len() < 5 {
        return Err(Error::Protocol(format!(
            "OP_MSG body of {} bytes is too short",
            body.len()
        )));
    }
    let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if flags & MSG_CHECKSUM_PRESENT != 0 {
        // We never advertise checksum support, so a checksummed frame is a
        // peer violating the negotiation.
        return Err(Error::Protocol("unexpected OP_MSG checksum".to_string()));
    }
    if body[4] != 0u8 {
        return Err(Error::Protocol(format!(
            "unsupported OP_MSG section kind {}",
            body[4]
        )));
    }
    let doc = Document::from_slice(&body[5..])?;
    Ok((flags, doc))
}

/// Decode an OP_REPLY body: flags, cursor id, startingFrom, then the
/// document batch.
pub fn decode_op_reply(body: &[u8]) -> Result<(u32, i64, i32, Vec<Document>)> {
    if body.len() < 20 {
        return Err(Error::Protocol(format!(
            "OP_REPLY body of {} bytes is too short",
            body.len()
        )));
    }
    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
    let starting_from = i32::from_le_bytes(body[12..16].try_into().unwrap());
    let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());

    let mut documents = Vec::new();
    let mut rest = &body[20..];
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::Protocol(
                "OP_REPLY document batch truncated".to_string(),
            ));
        }
        let len = i32::from_le_bytes(rest[0..4].try_into().unwrap());
        if len < 5 || len as usize > rest.len() {
            return Err(Error::Protocol(format!(
                "OP_REPLY document length {} exceeds remaining {} bytes",
                len,
                rest.len()
            )));
        }
        documents.push(Document::from_slice(&rest[..len as usize])?);
        rest = &rest[len as usize..];
    }
    if documents.len() != number_returned as usize {
        return Err(Error::Protocol(format!(
            "OP_REPLY declared {} documents, found {}",
            number_returned,
            documents.len()
        )));
    }
    Ok((flags, cursor_id, starting_from, documents))
}

/// Parse a complete frame (header + body) into a `Reply`, decompressing
/// OP_COMPRESSED payloads transparently.
pub fn decode_reply(header: &MessageHeader, body: &[u8]) -> Result<Reply> {
    if body.len() != header.message_length as usize - HEADER_LEN {
        return Err(Error::Protocol(format!(
            "declared length {} disagrees with {} available bytes",
            header.message_length,
            body.len() + HEADER_LEN
        )));
    }
    match header.op_code {
        OP_MSG => {
            let (flags, doc) = decode_op_msg_section0(body)?;
            Ok(Reply {
                response_to: header.response_to,
                flags,
                documents: vec![doc],
                cursor_id: 0,
                starting_from: 0,
            })
        }
        OP_REPLY => {
            let (flags, cursor_id, starting_from, documents) = decode_op_reply(body)?;
            Ok(Reply {
                response_to: header.response_to,
                flags,
                documents,
                cursor_id,
                starting_from,
            })
        }
        OP_COMPRESSED => {
            let op = compress::OpCompressed::parse(body)?;
            let inner_body = compress::decompress(&op)?;
            let inner_header = MessageHeader {
                message_length: (HEADER_LEN + inner_body.len()) as i32,
                request_id: header.request_id,
                response_to: header.response_to,
                op_code: op.original_opcode,
            };
            if inner_header.op_code == OP_COMPRESSED {
                return Err(Error::Protocol(
                    "nested OP_COMPRESSED frame".to_string(),
                ));
            }
            decode_reply(&inner_header, &inner_body)
        }
        other => Err(Error::UnsupportedOpCode(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[test]
    fn test_header_parse_round_trip() {
        let mut buf = BytesMut::new();
        let header = MessageHeader {
            message_length: 1234,
            request_id: 7,
            response_to: 3,
            op_code: OP_MSG,
        };
        header.put(&mut buf);
        let (parsed, consumed) = MessageHeader::parse(&buf).unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_parse_needs_sixteen_bytes() {
        assert!(MessageHeader::parse(&[0u8; 15]).is_none());
    }

    #[test]
    fn test_op_msg_round_trip() {
        let doc = doc! {"ping": 1i32, "$db": "admin"};
        let wire = encode_op_msg(&doc, 0, 42).unwrap();
        let (header, _) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(header.message_length as usize, wire.len());
        assert_eq!(header.request_id, 42);
        assert_eq!(header.op_code, OP_MSG);

        let reply = decode_reply(&header, &wire[HEADER_LEN..]).unwrap();
        assert_eq!(reply.documents, vec![doc]);
    }

    #[test]
    fn test_op_query_layout() {
        let query = doc! {"isMaster": 1i32};
        let wire = encode_op_query(&query, "admin.$cmd", QUERY_SECONDARY_OK, -1, 9).unwrap();
        let (header, _) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(header.op_code, OP_QUERY);
        assert_eq!(header.message_length as usize, wire.len());

        let body = &wire[HEADER_LEN..];
        let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
        assert_eq!(flags, QUERY_SECONDARY_OK);
        let name_end = 4 + "admin.$cmd".len();
        assert_eq!(&body[4..name_end], b"admin.$cmd");
        assert_eq!(body[name_end], 0);
    }

    #[test]
    fn test_op_query_decode_round_trip() {
        let query = doc! {"isMaster": 1i32, "client": {"driver": {"name": "rmongo"}}};
        let wire = encode_op_query(&query, "admin.$cmd", QUERY_SECONDARY_OK, -1, 3).unwrap();
        let (flags, ns, skip, n_return, decoded) =
            decode_op_query(&wire[HEADER_LEN..]).unwrap();
        assert_eq!(flags, QUERY_SECONDARY_OK);
        assert_eq!(ns, "admin.$cmd");
        assert_eq!(skip, 0);
        assert_eq!(n_return, -1);
        assert_eq!(decoded, query);
    }

    #[test]
    fn test_op_reply_encode_decode_round_trip() {
        let docs = vec![doc! {"ok": 1.0, "ismaster": true}];
        let wire = encode_op_reply(&docs, 0, 0, 3, 100).unwrap();
        let (header, _) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(header.op_code, OP_REPLY);
        assert_eq!(header.response_to, 3);
        let reply = decode_reply(&header, &wire[HEADER_LEN..]).unwrap();
        assert_eq!(reply.documents, docs);
    }

    #[test]
    fn test_op_reply_decode() {
        let docs = vec![doc! {"i": 1i32}, doc! {"i": 2i32}];
        let mut body = BytesMut::new();
        body.put_u32_le(REPLY_CURSOR_NOT_FOUND);
        body.put_i64_le(99);
        body.put_i32_le(0);
        body.put_i32_le(docs.len() as i32);
        for d in &docs {
            body.put_slice(&d.to_vec().unwrap());
        }

        let (flags, cursor_id, starting_from, decoded) = decode_op_reply(&body).unwrap();
        assert_eq!(flags, REPLY_CURSOR_NOT_FOUND);
        assert_eq!(cursor_id, 99);
        assert_eq!(starting_from, 0);
        assert_eq!(decoded, docs);
    }

    #[test]
    fn test_op_reply_count_mismatch_rejected() {
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_i64_le(0);
        body.put_i32_le(0);
        body.put_i32_le(2); // declares two docs, carries one
        body.put_slice(&doc! {"i": 1i32}.to_vec().unwrap());
        assert!(decode_op_reply(&body).is_err());
    }

    #[test]
    fn test_length_disagreement_is_protocol_error() {
        let doc = doc! {"ping": 1i32};
        let wire = encode_op_msg(&doc, 0, 1).unwrap();
        let (mut header, _) = MessageHeader::parse(&wire).unwrap();
        header.message_length += 4;
        let err = decode_reply(&header, &wire[HEADER_LEN..]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_unknown_op_code_rejected() {
        let header = MessageHeader {
            message_length: HEADER_LEN as i32,
            request_id: 1,
            response_to: 0,
            op_code: 4242,
        };
        assert!(matches!(
            decode_reply(&header, &[]),
            Err(Error::UnsupportedOpCode(4242))
        ));
    }
}
