//! 12-byte globally-ordered object identifiers.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::error::{Error, Result};

/// A 12-byte ObjectId: 4-byte big-endian seconds since the epoch, 5 bytes of
/// per-process random data, 3-byte big-endian counter seeded randomly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    bytes: [u8; 12],
}

static PROCESS_RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

fn process_random() -> [u8; 5] {
    *PROCESS_RANDOM.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    })
}

fn next_count() -> u32 {
    let counter = COUNTER.get_or_init(|| AtomicU32::new(rand::thread_rng().next_u32()));
    counter.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF
}

impl ObjectId {
    pub fn new() -> ObjectId {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let count = next_count();

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&process_random());
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        ObjectId { bytes }
    }

    pub fn from_bytes(bytes: [u8; 12]) -> ObjectId {
        ObjectId { bytes }
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.bytes
    }

    /// Seconds since the epoch embedded in the id.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(24);
        for b in &self.bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn parse_str(s: &str) -> Result<ObjectId> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(Error::MalformedDocument(format!(
                "invalid ObjectId hex: {:?}",
                s
            )));
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk)
                .map_err(|_| Error::MalformedDocument(format!("invalid ObjectId hex: {:?}", s)))?;
            bytes[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::MalformedDocument(format!("invalid ObjectId hex: {:?}", s)))?;
        }
        Ok(ObjectId { bytes })
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}
