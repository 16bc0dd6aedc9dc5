// Framing and payload codecs for the NSQ V2 wire protocol.
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;

mod command;

pub use command::Command;

/// Protocol magic sent once, immediately after the TCP connection opens.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response-frame payload the server sends as a liveness probe.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Generic success response payload.
pub const OK: &[u8] = b"OK";

/// Response to a `CLS` command once the server stops delivery.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// On-wire length of a message id.
pub const MSG_ID_LEN: usize = 16;

/// Default cap for a single frame's declared size.
///
/// The decoder allocates based on the length prefix, so a cap is enforced
/// before trusting it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("frame shorter than its type word")]
    TruncatedFrame,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("message payload of {0} bytes is too short")]
    TruncatedMessage(usize),
    #[error("message id must be {MSG_ID_LEN} printable ascii bytes")]
    InvalidMessageId,
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),
}

/// Frame types the server may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Response = 0,
    Error = 1,
    Message = 2,
}

impl TryFrom<u32> for FrameType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

/// A decoded server frame.
///
/// On the wire: a 32-bit big-endian size, a 32-bit big-endian frame type,
/// then `size - 4` payload bytes.
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use nsq_wire::{Frame, FrameDecoder, FrameType};
///
/// let frame = Frame::new(FrameType::Response, Bytes::from_static(b"OK"));
/// let mut buf = BytesMut::from(&frame.encode()[..]);
/// let decoded = FrameDecoder::default().decode(&mut buf).expect("decode");
/// assert_eq!(decoded, Some(frame));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.extend_from_slice(&((self.payload.len() as u32 + 4).to_be_bytes()));
        buf.extend_from_slice(&(self.frame_type as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Response && self.payload.as_ref() == HEARTBEAT
    }
}

/// Incremental frame decoder.
///
/// Feed raw stream bytes into a `BytesMut` and call [`FrameDecoder::decode`]
/// until it returns `None`; partial frames are left in the buffer untouched.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if size < 4 {
            return Err(Error::TruncatedFrame);
        }
        if size > self.max_frame_bytes {
            return Err(Error::FrameTooLarge(size));
        }
        if buf.len() < 4 + size {
            return Ok(None);
        }
        buf.advance(4);
        let mut payload = buf.split_to(size).freeze();
        let frame_type = FrameType::try_from(payload.get_u32())?;
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

/// A message id: 16 bytes of printable ascii assigned by the server.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MSG_ID_LEN]);

impl MessageId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id: [u8; MSG_ID_LEN] = bytes.try_into().map_err(|_| Error::InvalidMessageId)?;
        if !id.iter().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidMessageId);
        }
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees printable ascii.
        std::str::from_utf8(&self.0).unwrap_or("<invalid>")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.as_str())
    }
}

/// Decoded payload of a message frame.
///
/// Layout: 8-byte big-endian nanosecond timestamp, 2-byte big-endian attempt
/// count, 16-byte ascii id, then the opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBody {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl MessageBody {
    pub const HEADER_LEN: usize = 8 + 2 + MSG_ID_LEN;

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < Self::HEADER_LEN {
            return Err(Error::TruncatedMessage(payload.len()));
        }
        let timestamp = payload.get_i64();
        let attempts = payload.get_u16();
        let id = MessageId::from_bytes(&payload.split_to(MSG_ID_LEN))?;
        Ok(Self {
            timestamp,
            attempts,
            id,
            body: payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.attempts.to_be_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Topic names: 1-64 chars of `[.a-zA-Z0-9_-]`, optional `#ephemeral` suffix.
pub fn valid_topic_name(name: &str) -> bool {
    valid_name(name)
}

/// Channel names follow the same rules as topic names.
pub fn valid_channel_name(name: &str) -> bool {
    valid_name(name)
}

fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}
