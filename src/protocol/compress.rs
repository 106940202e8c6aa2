//! OP_COMPRESSED framing with the snappy, zlib and zstd compressors.
//!
//! Compressors are negotiated during the handshake: the client advertises
//! what it speaks, the server answers with the subset it accepts, and both
//! sides then wrap every non-handshake message.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use super::{HEADER_LEN, MessageHeader, OP_COMPRESSED};
use crate::error::{Error, Result};

const COMPRESSOR_NOOP: u8 = 0;
const COMPRESSOR_SNAPPY: u8 = 1;
const COMPRESSOR_ZLIB: u8 = 2;
const COMPRESSOR_ZSTD: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Snappy,
    Zlib,
    Zstd,
}

impl Compressor {
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Snappy => COMPRESSOR_SNAPPY,
            Compressor::Zlib => COMPRESSOR_ZLIB,
            Compressor::Zstd => COMPRESSOR_ZSTD,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Snappy => "snappy",
            Compressor::Zlib => "zlib",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Compressor> {
        match name {
            "snappy" => Some(Compressor::Snappy),
            "zlib" => Some(Compressor::Zlib),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }
}

/// A parsed OP_COMPRESSED body.
#[derive(Debug)]
pub struct OpCompressed {
    pub original_opcode: i32,
    pub uncompressed_size: i32,
    pub compressor_id: u8,
    pub payload: Vec<u8>,
}

impl OpCompressed {
    pub fn parse(body: &[u8]) -> Result<OpCompressed> {
        if body.len() < 9 {
            return Err(Error::Protocol(format!(
                "OP_COMPRESSED body of {} bytes is too short",
                body.len()
            )));
        }
        Ok(OpCompressed {
            original_opcode: i32::from_le_bytes(body[0..4].try_into().unwrap()),
            uncompressed_size: i32::from_le_bytes(body[4..8].try_into().unwrap()),
            compressor_id: body[8],
            payload: body[9..].to_vec(),
        })
    }
}

/// Wrap an already-encoded message body in an OP_COMPRESSED frame.
pub fn encode_op_compressed(
    original_opcode: i32,
    body: &[u8],
    compressor: Compressor,
    response_to: i32,
    request_id: i32,
) -> Result<Bytes> {
    let compressed = compress(body, compressor)?;
    let message_length = (HEADER_LEN + 9 + compressed.len()) as i32;

    let mut out = BytesMut::with_capacity(message_length as usize);
    MessageHeader {
        message_length,
        request_id,
        response_to,
        op_code: OP_COMPRESSED,
    }
    .put(&mut out);
    out.put_i32_le(original_opcode);
    out.put_i32_le(body.len() as i32);
    out.put_u8(compressor.id());
    out.put_slice(&compressed);
    Ok(out.freeze())
}

pub fn compress(data: &[u8], compressor: Compressor) -> Result<Vec<u8>> {
    match compressor {
        Compressor::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Protocol(format!("snappy compression failed: {}", e))),
        Compressor::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compressor::Zstd => {
            zstd::bulk::compress(data, 0).map_err(Error::Io)
        }
    }
}

pub fn decompress(op: &OpCompressed) -> Result<Vec<u8>> {
    let out = match op.compressor_id {
        COMPRESSOR_NOOP => op.payload.clone(),
        COMPRESSOR_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(&op.payload)
            .map_err(|e| Error::Protocol(format!("snappy decompression failed: {}", e)))?,
        COMPRESSOR_ZLIB => {
            let mut decoder = flate2::read::ZlibDecoder::new(op.payload.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
        COMPRESSOR_ZSTD => zstd::stream::decode_all(op.payload.as_slice()).map_err(Error::Io)?,
        other => {
            return Err(Error::Protocol(format!("unknown compressor id {}", other)));
        }
    };
    if out.len() != op.uncompressed_size as usize {
        return Err(Error::Protocol(format!(
            "compressed frame declared {} uncompressed bytes, got {}",
            op.uncompressed_size,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::protocol::{OP_MSG, decode_reply};

    #[test]
    fn test_round_trip_each_compressor() {
        let doc = doc! {"insert": "u", "documents": [{"i": 1}, {"i": 2}], "$db": "test"};
        let plain = crate::protocol::encode_op_msg(&doc, 0, 5).unwrap();
        let body = &plain[HEADER_LEN..];

        for compressor in [Compressor::Snappy, Compressor::Zlib, Compressor::Zstd] {
            let wire = encode_op_compressed(OP_MSG, body, compressor, 0, 5).unwrap();
            let (header, _) = MessageHeader::parse(&wire).unwrap();
            assert_eq!(header.op_code, OP_COMPRESSED);
            assert_eq!(header.message_length as usize, wire.len());

            let reply = decode_reply(&header, &wire[HEADER_LEN..]).unwrap();
            assert_eq!(reply.documents, vec![doc.clone()], "{}", compressor.name());
        }
    }

    #[test]
    fn test_noop_compressor_decodes() {
        let payload = doc! {"ok": 1.0}.to_vec().unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&OP_MSG.to_le_bytes());
        body.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        body.push(COMPRESSOR_NOOP);
        body.extend_from_slice(&payload);

        let op = OpCompressed::parse(&body).unwrap();
        assert_eq!(decompress(&op).unwrap(), payload);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let compressed = compress(b"hello world", Compressor::Snappy).unwrap();
        let op = OpCompressed {
            original_opcode: OP_MSG,
            uncompressed_size: 5, // actually 11
            compressor_id: COMPRESSOR_SNAPPY,
            payload: compressed,
        };
        assert!(matches!(decompress(&op), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_compressor_rejected() {
        let op = OpCompressed {
            original_opcode: OP_MSG,
            uncompressed_size: 0,
            compressor_id: 9,
            payload: Vec::new(),
        };
        assert!(matches!(decompress(&op), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_compressor_names() {
        for c in [Compressor::Snappy, Compressor::Zlib, Compressor::Zstd] {
            assert_eq!(Compressor::from_name(c.name()), Some(c));
        }
        assert_eq!(Compressor::from_name("lz4"), None);
    }
}
