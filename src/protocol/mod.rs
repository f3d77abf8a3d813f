//! Protocol layer for the matchmaker
//!
//! This module provides:
//! - Binary frame encoding/decoding
//! - Message type definitions
//! - Codec traits for serialization

pub mod codec;
pub mod frame;
pub mod messages;

// Re-export commonly used types
pub use codec::{ClientCommand, Decodable, Encodable, decode, encode};
pub use frame::{Frame, FrameCodec, FrameType, HEADER_LEN, MAX_PAYLOAD_BYTES};
pub use messages::*;
