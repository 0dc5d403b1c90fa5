//! Node wire protocol.
//!
//! Frames are a 4-byte big-endian length followed by a bincode-encoded
//! [`ClientMessage`] or [`ServerMessage`]. A connection opens with a
//! `Hello`/`Welcome` handshake that selects the bucket; after that every
//! request carries an opaque correlation id which the node echoes back, so
//! any number of requests may be outstanding on one connection and their
//! responses may arrive in any order.

use std::{fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Operation;

/// Frames larger than this are rejected as corrupt rather than allocated.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    Hello { bucket: String, password: String },
    Request(Request),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    Welcome { node: String },
    Rejected { reason: String },
    Response(Response),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub opaque: u64,
    pub partition: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub opaque: u64,
    pub status: Status,
    pub cas: u64,
    pub flags: u32,
    pub value: Option<Vec<u8>>,
    pub counter: Option<u64>,
}

impl Response {
    pub fn new(opaque: u64, status: Status) -> Self {
        Self {
            opaque,
            status,
            cas: 0,
            flags: 0,
            value: None,
            counter: None,
        }
    }

    pub fn success(opaque: u64, cas: u64) -> Self {
        Self {
            cas,
            ..Self::new(opaque, Status::Success)
        }
    }
}

/// Status codes a node can answer with.
///
/// `NotMyPartition` is the only routing signal; `TemporaryFailure` asks the
/// client to back off and try again. Everything else is a definitive answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    /// Key already exists, or the supplied CAS did not match.
    KeyExists,
    NotStored,
    ValueTooLarge,
    DeltaBadValue,
    Locked,
    InvalidArguments,
    NotMyPartition,
    TemporaryFailure,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists or cas mismatch",
            Status::NotStored => "item not stored",
            Status::ValueTooLarge => "value too large",
            Status::DeltaBadValue => "counter value is not numeric",
            Status::Locked => "item is locked",
            Status::InvalidArguments => "invalid arguments",
            Status::NotMyPartition => "node does not own partition",
            Status::TemporaryFailure => "temporary failure",
        };
        f.write_str(text)
    }
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        // A clean close between frames is not an error.
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let parsed = bincode::deserialize(&buf).map_err(to_io_error)?;
    Ok(Some(parsed))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message).map_err(to_io_error)?;
    let len = u32::try_from(encoded.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

    let mut framed = Vec::with_capacity(4 + encoded.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&encoded);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
