//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.

use super::frame::{Frame, FrameType};
use super::messages::*;
use bytes::Bytes;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.kind != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.kind
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Helper macro to implement Encodable and Decodable for a message type
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

// Control messages
impl_codec!(Hello, FrameType::Hello);
impl_codec!(HelloAck, FrameType::HelloAck);
impl_codec!(Auth, FrameType::Auth);
impl_codec!(AuthOk, FrameType::AuthOk);
impl_codec!(AuthFailed, FrameType::AuthFailed);
impl_codec!(Ping, FrameType::Ping);
impl_codec!(Pong, FrameType::Pong);
impl_codec!(Goodbye, FrameType::Goodbye);
impl_codec!(ConnectionAck, FrameType::ConnectionAck);
impl_codec!(ConnectionRecovered, FrameType::ConnectionRecovered);

// Search commands
impl_codec!(SearchStart, FrameType::SearchStart);
impl_codec!(SearchCancel, FrameType::SearchCancel);
impl_codec!(SubscribeStats, FrameType::SubscribeStats);
impl_codec!(UnsubscribeStats, FrameType::UnsubscribeStats);

// Chat commands
impl_codec!(ChatJoin, FrameType::ChatJoin);
impl_codec!(ChatLeave, FrameType::ChatLeave);
impl_codec!(ChatMessage, FrameType::ChatMessage);
impl_codec!(ChatTyping, FrameType::ChatTyping);
impl_codec!(ChatRead, FrameType::ChatRead);
impl_codec!(ChatEnd, FrameType::ChatEnd);
impl_codec!(ChatRate, FrameType::ChatRate);

// Contact commands
impl_codec!(ContactRequest, FrameType::ContactRequest);
impl_codec!(ContactRespond, FrameType::ContactRespond);

// Search events
impl_codec!(SearchStatus, FrameType::SearchStatus);
impl_codec!(SearchMatched, FrameType::SearchMatched);
impl_codec!(SearchExpired, FrameType::SearchExpired);
impl_codec!(SearchStats, FrameType::SearchStats);

// Chat events
impl_codec!(ChatMessageEvent, FrameType::ChatMessageEvent);
impl_codec!(ChatTypingEvent, FrameType::ChatTypingEvent);
impl_codec!(ChatReadEvent, FrameType::ChatReadEvent);
impl_codec!(ChatEnded, FrameType::ChatEnded);
impl_codec!(ChatRated, FrameType::ChatRated);

// Contact events
impl_codec!(ContactRequested, FrameType::ContactRequested);
impl_codec!(ContactStatus, FrameType::ContactStatus);

// Error message
impl_codec!(ErrorEvent, FrameType::Error);

/// Decode any inbound client frame into a typed command enum
#[derive(Debug, Clone)]
pub enum ClientCommand {
    // Control
    Hello(Hello),
    Auth(Auth),
    Ping(Ping),
    Pong(Pong),
    Goodbye(Goodbye),
    ConnectionAck(ConnectionAck),

    // Search
    SearchStart(SearchStart),
    SearchCancel(SearchCancel),
    SubscribeStats(SubscribeStats),
    UnsubscribeStats(UnsubscribeStats),

    // Chat
    ChatJoin(ChatJoin),
    ChatLeave(ChatLeave),
    ChatMessage(ChatMessage),
    ChatTyping(ChatTyping),
    ChatRead(ChatRead),
    ChatEnd(ChatEnd),
    ChatRate(ChatRate),

    // Contact
    ContactRequest(ContactRequest),
    ContactRespond(ContactRespond),
}

impl ClientCommand {
    /// Decode a frame into a typed client command
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.kind {
            FrameType::Hello => Ok(Self::Hello(serde_json::from_slice(payload)?)),
            FrameType::Auth => Ok(Self::Auth(serde_json::from_slice(payload)?)),
            FrameType::Ping => Ok(Self::Ping(serde_json::from_slice(payload)?)),
            FrameType::Pong => Ok(Self::Pong(serde_json::from_slice(payload)?)),
            FrameType::Goodbye => Ok(Self::Goodbye(serde_json::from_slice(payload)?)),
            FrameType::ConnectionAck => {
                Ok(Self::ConnectionAck(decode_or_default(payload)?))
            }

            FrameType::SearchStart => Ok(Self::SearchStart(serde_json::from_slice(payload)?)),
            FrameType::SearchCancel => Ok(Self::SearchCancel(decode_or_default(payload)?)),
            FrameType::SubscribeStats => Ok(Self::SubscribeStats(decode_or_default(payload)?)),
            FrameType::UnsubscribeStats => {
                Ok(Self::UnsubscribeStats(decode_or_default(payload)?))
            }

            FrameType::ChatJoin => Ok(Self::ChatJoin(serde_json::from_slice(payload)?)),
            FrameType::ChatLeave => Ok(Self::ChatLeave(serde_json::from_slice(payload)?)),
            FrameType::ChatMessage => Ok(Self::ChatMessage(serde_json::from_slice(payload)?)),
            FrameType::ChatTyping => Ok(Self::ChatTyping(serde_json::from_slice(payload)?)),
            FrameType::ChatRead => Ok(Self::ChatRead(serde_json::from_slice(payload)?)),
            FrameType::ChatEnd => Ok(Self::ChatEnd(serde_json::from_slice(payload)?)),
            FrameType::ChatRate => Ok(Self::ChatRate(serde_json::from_slice(payload)?)),

            FrameType::ContactRequest => Ok(Self::ContactRequest(serde_json::from_slice(payload)?)),
            FrameType::ContactRespond => Ok(Self::ContactRespond(serde_json::from_slice(payload)?)),

            other => Err(IoError::new(
                ErrorKind::InvalidData,
                format!("Frame type {:?} is not a client command", other),
            )),
        }
    }

    /// Get the frame type of this command
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello(_) => FrameType::Hello,
            Self::Auth(_) => FrameType::Auth,
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::Goodbye(_) => FrameType::Goodbye,
            Self::ConnectionAck(_) => FrameType::ConnectionAck,
            Self::SearchStart(_) => FrameType::SearchStart,
            Self::SearchCancel(_) => FrameType::SearchCancel,
            Self::SubscribeStats(_) => FrameType::SubscribeStats,
            Self::UnsubscribeStats(_) => FrameType::UnsubscribeStats,
            Self::ChatJoin(_) => FrameType::ChatJoin,
            Self::ChatLeave(_) => FrameType::ChatLeave,
            Self::ChatMessage(_) => FrameType::ChatMessage,
            Self::ChatTyping(_) => FrameType::ChatTyping,
            Self::ChatRead(_) => FrameType::ChatRead,
            Self::ChatEnd(_) => FrameType::ChatEnd,
            Self::ChatRate(_) => FrameType::ChatRate,
            Self::ContactRequest(_) => FrameType::ContactRequest,
            Self::ContactRespond(_) => FrameType::ContactRespond,
        }
    }

    /// Check if this is a control message
    pub fn is_control(&self) -> bool {
        self.frame_type().is_control()
    }
}

/// Commands with no required fields also accept an empty payload
fn decode_or_default<T: Default + serde::de::DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    if payload.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
}

/// Encode a message directly to bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame().map(|f| f.to_bytes())
}

/// Decode a frame to a specific message type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = ChatMessage {
            chat_id: "chat-1".to_string(),
            content: "Hello, World!".to_string(),
        };

        let frame = original.encode_frame().unwrap();
        assert_eq!(frame.kind, FrameType::ChatMessage);

        let decoded = ChatMessage::decode_frame(&frame).unwrap();
        assert_eq!(original.chat_id, decoded.chat_id);
        assert_eq!(original.content, decoded.content);
    }

    #[test]
    fn test_client_command_enum() {
        let msg = Ping { timestamp: 12345 };
        let frame = msg.encode_frame().unwrap();

        let decoded = ClientCommand::decode(&frame).unwrap();
        assert!(decoded.is_control());

        match decoded {
            ClientCommand::Ping(ping) => {
                assert_eq!(ping.timestamp, 12345);
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_event_frame_is_not_client_command() {
        let event = SearchExpired {};
        let frame = event.encode_frame().unwrap();

        assert!(ClientCommand::decode(&frame).is_err());
    }

    #[test]
    fn test_empty_payload_commands() {
        let frame = Frame::empty(FrameType::SearchCancel);
        let decoded = ClientCommand::decode(&frame).unwrap();
        assert!(matches!(decoded, ClientCommand::SearchCancel(_)));

        let frame = Frame::empty(FrameType::SubscribeStats);
        let decoded = ClientCommand::decode(&frame).unwrap();
        assert!(matches!(decoded, ClientCommand::SubscribeStats(_)));
    }

    #[test]
    fn test_wrong_frame_type() {
        let msg = Ping { timestamp: 12345 };
        let frame = msg.encode_frame().unwrap();

        // Try to decode as Pong (wrong type)
        let result = Pong::decode_frame(&frame);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_helper() {
        let msg = Hello::default();
        let bytes = encode(&msg).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn test_error_event_encoding() {
        let err = ErrorEvent::new(1006, "chat already ended");
        let frame = err.encode_frame().unwrap();

        let decoded = ErrorEvent::decode_frame(&frame).unwrap();
        assert_eq!(decoded.code, 1006);
        assert_eq!(decoded.message, "chat already ended");
    }

    #[test]
    fn test_search_matched_encoding() {
        let msg = SearchMatched {
            matched_user: MatchedUser {
                telegram_id: 555,
                gender: Gender::Female,
                age: 24,
                chat_id: "chat-9".to_string(),
            },
        };

        let frame = msg.encode_frame().unwrap();
        let decoded = SearchMatched::decode_frame(&frame).unwrap();

        assert_eq!(decoded.matched_user.telegram_id, 555);
        assert_eq!(decoded.matched_user.chat_id, "chat-9");
    }
}
