// Wire codec for the norq broker TCP protocol.
//
// Commands are an ASCII verb line plus an optional size-prefixed body;
// broker replies are length-prefixed frames tagged response, error, or
// message. This crate is pure encoding and decoding; socket IO lives in
// norq-client.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Protocol magic written once per connection, before any command.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response body for a successfully processed command.
pub const OK: &[u8] = b"OK";
/// Response body for broker liveness probes; must be answered with `NOP`.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
/// Response body acknowledging a `CLS` command.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const MESSAGE_ID_LEN: usize = 16;
/// Fixed prefix of a message envelope: timestamp + attempts + id.
pub const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("truncated message envelope")]
    TruncatedMessage,
    #[error("invalid topic or channel name {0:?}")]
    InvalidName(String),
}

/// Tag carried by every broker frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Response),
            1 => Ok(Self::Error),
            2 => Ok(Self::Message),
            other => Err(Error::UnknownFrameType(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Response => 0,
            Self::Error => 1,
            Self::Message => 2,
        }
    }
}

/// One broker frame: `[u32 size][u32 frame_type][body]`, where `size`
/// counts the frame-type word plus the body.
///
/// ```
/// use bytes::Bytes;
/// use norq_wire::{Frame, FrameType};
///
/// let frame = Frame::response(b"OK");
/// let encoded = frame.encode().expect("encode");
/// let decoded = Frame::decode(encoded.slice(4..)).expect("decode");
/// assert_eq!(decoded.frame_type, FrameType::Response);
/// assert_eq!(decoded.body, Bytes::from_static(b"OK"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub body: Bytes,
}

impl Frame {
    /// Decode the sized portion of a frame, everything after the length
    /// prefix. The caller reads (and bounds-checks) the prefix itself.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        let frame_type = FrameType::from_wire(payload.get_u32())?;
        Ok(Self {
            frame_type,
            body: payload,
        })
    }

    /// Encode with the length prefix, as the broker puts it on the wire.
    pub fn encode(&self) -> Result<Bytes> {
        let size = 4usize
            .checked_add(self.body.len())
            .filter(|size| *size <= u32::MAX as usize)
            .ok_or(Error::FrameTooLarge)?;
        let mut buf = BytesMut::with_capacity(4 + size);
        buf.put_u32(size as u32);
        buf.put_u32(self.frame_type.to_wire());
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }

    pub fn response(body: &[u8]) -> Self {
        Self {
            frame_type: FrameType::Response,
            body: Bytes::copy_from_slice(body),
        }
    }

    pub fn error(body: &[u8]) -> Self {
        Self {
            frame_type: FrameType::Error,
            body: Bytes::copy_from_slice(body),
        }
    }
}

/// Opaque 16-byte message id, printable ASCII on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MessageId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; MESSAGE_ID_LEN] =
            value.try_into().map_err(|_| Error::TruncatedMessage)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Decoded message envelope: `[i64 ns timestamp][u16 attempts][id][body]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub timestamp_ns: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl MessageFrame {
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.remaining() < MESSAGE_HEADER_LEN {
            return Err(Error::TruncatedMessage);
        }
        let timestamp_ns = body.get_i64();
        let attempts = body.get_u16();
        let mut id = [0u8; MESSAGE_ID_LEN];
        body.copy_to_slice(&mut id);
        Ok(Self {
            timestamp_ns,
            attempts,
            id: MessageId(id),
            body,
        })
    }

    /// Encode as a full message frame; the broker-side (and test broker)
    /// counterpart of [`MessageFrame::decode`].
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(MESSAGE_HEADER_LEN + self.body.len());
        body.put_i64(self.timestamp_ns);
        body.put_u16(self.attempts);
        body.extend_from_slice(&self.id.0);
        body.extend_from_slice(&self.body);
        Frame {
            frame_type: FrameType::Message,
            body: body.freeze(),
        }
        .encode()
    }
}

/// Client commands. `encode` validates topic and channel names before
/// anything touches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify { body: Vec<u8> },
    Sub { topic: String, channel: String },
    Pub { topic: String, payload: Vec<u8> },
    Mpub { topic: String, payloads: Vec<Vec<u8>> },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Cls,
    Nop,
}

impl Command {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Command::Identify { body } => {
                buf.extend_from_slice(b"IDENTIFY\n");
                put_sized(&mut buf, body)?;
            }
            Command::Sub { topic, channel } => {
                check_name(topic)?;
                check_name(channel)?;
                buf.extend_from_slice(b"SUB ");
                buf.extend_from_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.extend_from_slice(channel.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Pub { topic, payload } => {
                check_name(topic)?;
                buf.reserve(payload.len() + 16);
                buf.extend_from_slice(b"PUB ");
                buf.extend_from_slice(topic.as_bytes());
                buf.put_u8(b'\n');
                put_sized(&mut buf, payload)?;
            }
            Command::Mpub { topic, payloads } => {
                check_name(topic)?;
                buf.extend_from_slice(b"MPUB ");
                buf.extend_from_slice(topic.as_bytes());
                buf.put_u8(b'\n');
                // Body: total size, payload count, then each sized payload.
                let mut total = 4usize;
                for payload in payloads {
                    total = total
                        .checked_add(4 + payload.len())
                        .ok_or(Error::FrameTooLarge)?;
                }
                if total > u32::MAX as usize {
                    return Err(Error::FrameTooLarge);
                }
                buf.reserve(total + 4);
                buf.put_u32(total as u32);
                buf.put_u32(payloads.len() as u32);
                for payload in payloads {
                    put_sized(&mut buf, payload)?;
                }
            }
            Command::Rdy(count) => {
                buf.extend_from_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                buf.extend_from_slice(b"FIN ");
                buf.extend_from_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Req { id, delay_ms } => {
                buf.extend_from_slice(b"REQ ");
                buf.extend_from_slice(id.as_bytes());
                buf.extend_from_slice(format!(" {delay_ms}\n").as_bytes());
            }
            Command::Touch(id) => {
                buf.extend_from_slice(b"TOUCH ");
                buf.extend_from_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
        }
        Ok(buf.freeze())
    }
}

fn put_sized(buf: &mut BytesMut, body: &[u8]) -> Result<()> {
    if body.len() > u32::MAX as usize {
        return Err(Error::FrameTooLarge);
    }
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    Ok(())
}

/// Whether `name` is a legal topic or channel name: 1..=64 bytes of
/// `[A-Za-z0-9._-]`, optionally ending in `#ephemeral`.
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn check_name(name: &str) -> Result<()> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}
