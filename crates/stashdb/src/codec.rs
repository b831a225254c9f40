//! Blob codec using nom
//!
//! Decides whether a payload lives inline in the index row or in its own
//! blob file, and frames blob files so they carry their own mode.
//!
//! Blob file format:
//! ```text
//! STSH
//! [1 byte: format version]
//! [1 byte: mode (1 raw, 2 text, 3 serialized)]
//! [8 bytes: payload length u64 little-endian]
//! ...payload...
//! ```

use nom::{
    bytes::complete::tag,
    number::complete::{le_u64, u8 as byte},
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};
use crate::key::{Mode, Value};

/// Magic header for blob files
pub const BLOB_MAGIC: &[u8] = b"STSH";

/// Current blob format version
pub const BLOB_VERSION: u8 = 1;

/// Length of the blob header in bytes
pub const HEADER_LEN: usize = 4 + 1 + 1 + 8;

/// Blob file header
#[derive(Debug, Clone, PartialEq)]
pub struct BlobHeader {
    /// File format version
    pub version: u8,
    /// Mode of the payload that follows
    pub mode: Mode,
    /// Payload length in bytes
    pub len: u64,
}

/// Where an encoded payload is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// In the index row
    Inline,
    /// In a dedicated blob file
    File,
}

/// Output of [`encode`]
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Value mode
    pub mode: Mode,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Chosen placement
    pub placement: Placement,
}

impl Encoded {
    /// Size charged against the cache's capacity.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Encode a value, storing it inline when it fits under `size_threshold`.
pub fn encode(value: Value, size_threshold: u64) -> Encoded {
    let mode = value.mode();
    let payload = match value {
        Value::Bytes(b) | Value::Data(b) => b,
        Value::Text(s) => s.into_bytes(),
    };
    let placement = if payload.len() as u64 <= size_threshold {
        Placement::Inline
    } else {
        Placement::File
    };
    Encoded {
        mode,
        payload,
        placement,
    }
}

/// Decode an inline payload read from an index row.
pub fn decode_inline(mode: Mode, payload: Vec<u8>) -> Result<Value> {
    Value::from_parts(mode, payload)
}

/// Decode the full contents of a blob file.
pub fn decode_blob(contents: &[u8]) -> Result<Value> {
    let header = parse_header(contents)?;
    let body = &contents[HEADER_LEN..];
    if body.len() as u64 != header.len {
        return Err(Error::Corrupt(format!(
            "blob payload is {} bytes, header says {}",
            body.len(),
            header.len
        )));
    }
    Value::from_parts(header.mode, body.to_vec())
}

/// Create a blob header for a payload
pub fn create_header(mode: Mode, len: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(BLOB_MAGIC);
    header.push(BLOB_VERSION);
    header.push(mode as u8);
    header.extend_from_slice(&len.to_le_bytes());
    header
}

fn header_fields(input: &[u8]) -> IResult<&[u8], (&[u8], u8, u8, u64)> {
    tuple((tag(BLOB_MAGIC), byte, byte, le_u64))(input)
}

/// Parse a blob header
pub fn parse_header(input: &[u8]) -> Result<BlobHeader> {
    if input.len() < HEADER_LEN {
        return Err(Error::Corrupt("input too short for blob header".to_string()));
    }

    let (_, (_, version, mode, len)) = header_fields(input)?;
    if version != BLOB_VERSION {
        return Err(Error::Corrupt(format!("unsupported blob version {}", version)));
    }

    Ok(BlobHeader {
        version,
        mode: Mode::from_u8(mode)?,
        len,
    })
}
