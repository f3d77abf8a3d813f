//! Length-prefixed binary framing
//!
//! Every frame carries a one-byte kind tag, a u32 big-endian payload
//! length and the payload itself. Payloads above [`MAX_PAYLOAD_BYTES`]
//! are rejected at the header so a single oversized frame cannot
//! balloon the read buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Wire size of the kind tag plus the length word
pub const HEADER_LEN: usize = 5;

/// Hard cap on a frame payload (1 MB)
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Frame kinds, grouped by direction and concern
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    // Control stream messages (0x00 - 0x0F)
    Hello = 0x00,
    HelloAck = 0x01,
    Auth = 0x02,
    AuthOk = 0x03,
    AuthFailed = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Goodbye = 0x07,
    ConnectionAck = 0x08,
    ConnectionRecovered = 0x09,

    // Search commands (0x10 - 0x1F) - Client -> Server
    SearchStart = 0x10,
    SearchCancel = 0x11,
    SubscribeStats = 0x12,
    UnsubscribeStats = 0x13,

    // Chat commands (0x20 - 0x2F) - Client -> Server
    ChatJoin = 0x20,
    ChatLeave = 0x21,
    ChatMessage = 0x22,
    ChatTyping = 0x23,
    ChatRead = 0x24,
    ChatEnd = 0x25,
    ChatRate = 0x26,

    // Contact commands (0x30 - 0x3F) - Client -> Server
    ContactRequest = 0x30,
    ContactRespond = 0x31,

    // Search events (0x40 - 0x4F) - Server -> Client
    SearchStatus = 0x40,
    SearchMatched = 0x41,
    SearchExpired = 0x42,
    SearchStats = 0x43,

    // Chat events (0x50 - 0x5F) - Server -> Client
    ChatMessageEvent = 0x50,
    ChatTypingEvent = 0x51,
    ChatReadEvent = 0x52,
    ChatEnded = 0x53,
    ChatRated = 0x54,

    // Contact events (0x60 - 0x6F) - Server -> Client
    ContactRequested = 0x60,
    ContactStatus = 0x61,

    // Error (0xFF)
    Error = 0xFF,
}

impl FrameType {
    /// Map a wire byte back to a kind; None for anything unassigned
    pub fn from_byte(value: u8) -> Option<Self> {
        let kind = match value {
            0x00 => FrameType::Hello,
            0x01 => FrameType::HelloAck,
            0x02 => FrameType::Auth,
            0x03 => FrameType::AuthOk,
            0x04 => FrameType::AuthFailed,
            0x05 => FrameType::Ping,
            0x06 => FrameType::Pong,
            0x07 => FrameType::Goodbye,
            0x08 => FrameType::ConnectionAck,
            0x09 => FrameType::ConnectionRecovered,

            0x10 => FrameType::SearchStart,
            0x11 => FrameType::SearchCancel,
            0x12 => FrameType::SubscribeStats,
            0x13 => FrameType::UnsubscribeStats,

            0x20 => FrameType::ChatJoin,
            0x21 => FrameType::ChatLeave,
            0x22 => FrameType::ChatMessage,
            0x23 => FrameType::ChatTyping,
            0x24 => FrameType::ChatRead,
            0x25 => FrameType::ChatEnd,
            0x26 => FrameType::ChatRate,

            0x30 => FrameType::ContactRequest,
            0x31 => FrameType::ContactRespond,

            0x40 => FrameType::SearchStatus,
            0x41 => FrameType::SearchMatched,
            0x42 => FrameType::SearchExpired,
            0x43 => FrameType::SearchStats,

            0x50 => FrameType::ChatMessageEvent,
            0x51 => FrameType::ChatTypingEvent,
            0x52 => FrameType::ChatReadEvent,
            0x53 => FrameType::ChatEnded,
            0x54 => FrameType::ChatRated,

            0x60 => FrameType::ContactRequested,
            0x61 => FrameType::ContactStatus,

            0xFF => FrameType::Error,
            _ => return None,
        };
        Some(kind)
    }

    /// Handshake and keepalive frames
    pub fn is_control(&self) -> bool {
        (*self as u8) < 0x10
    }

    /// Client-to-server search commands
    pub fn is_search_command(&self) -> bool {
        let byte = *self as u8;
        (0x10..0x20).contains(&byte)
    }

    /// Client-to-server chat commands
    pub fn is_chat_command(&self) -> bool {
        let byte = *self as u8;
        (0x20..0x30).contains(&byte)
    }

    /// Client-to-server contact-exchange commands
    pub fn is_contact_command(&self) -> bool {
        let byte = *self as u8;
        (0x30..0x40).contains(&byte)
    }

    /// Server-to-client events, the error event included
    pub fn is_event(&self) -> bool {
        let byte = *self as u8;
        (0x40..0x70).contains(&byte) || byte == 0xFF
    }

    /// Kinds that may also travel as unreliable datagrams
    pub fn is_datagram(&self) -> bool {
        matches!(self, FrameType::ChatTyping | FrameType::ChatTypingEvent)
    }
}

/// One frame: a kind tag and its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A frame with no payload
    pub fn empty(kind: FrameType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Encoded size on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to a buffer
    pub fn write_to(&self, out: &mut BytesMut) {
        out.reserve(self.wire_len());
        out.put_u8(self.kind as u8);
        out.put_u32(self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
    }

    /// Encode into a fresh byte buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut out);
        out.freeze()
    }

    /// Parse exactly one frame from a complete buffer (datagram path)
    pub fn parse(data: &[u8]) -> io::Result<Frame> {
        let (kind, payload_len) = match read_header(data)? {
            Some(header) => header,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ));
            }
        };

        let end = HEADER_LEN + payload_len;
        if data.len() < end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated frame: have {} of {} bytes", data.len(), end),
            ));
        }

        Ok(Frame {
            kind,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..end]),
        })
    }
}

/// Read and validate a header without consuming anything; Ok(None)
/// means the buffer does not hold a full header yet
fn read_header(data: &[u8]) -> io::Result<Option<(FrameType, usize)>> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }

    let kind = FrameType::from_byte(data[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind 0x{:02X}", data[0]),
        )
    })?;

    let payload_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame payload of {} bytes exceeds the {} byte cap",
                payload_len, MAX_PAYLOAD_BYTES
            ),
        ));
    }

    Ok(Some((kind, payload_len)))
}

/// Incremental decoder over a stream of byte chunks
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::new(),
        }
    }

    /// Buffer another chunk read off the stream
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let (kind, payload_len) = match read_header(&self.pending)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if self.pending.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        self.pending.advance(HEADER_LEN);
        let payload = self.pending.split_to(payload_len).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    /// Bytes buffered but not yet decoded
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
