//! Tandem - Real-Time Anonymous-Chat Matchmaker
//!
//! This library implements a matchmaking and real-time messaging server
//! over QUIC. Users submit search criteria; the server pairs two
//! mutually compatible users, opens an ephemeral chat room between
//! them, streams messages and presence events, and maintains a live
//! global view of who is searching.
//!
//! ## Architecture
//!
//! - **Protocol**: length-prefixed binary frames with typed JSON
//!   payloads on one bidirectional control stream per connection;
//!   typing indicators additionally travel as unreliable datagrams
//! - **ConnectionHub**: authenticated sessions, per-user multi-session
//!   fan-out, rooms, reconnection recovery
//! - **Matcher**: compatibility predicate, scoring, atomic pair
//!   creation with rollback, cancellation and expiry
//! - **StatsBroadcaster**: cached global counters with debounced,
//!   coalesced broadcasts
//! - **ChatRouter**: message, typing, read, end and rate events scoped
//!   to chat rooms
//! - **CircuitBreaker**: guards the store on the matcher and chat paths
//! - **Janitor**: periodic expiry of dormant searches, idle chats and
//!   stale tokens
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem::{Config, MatchServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     // wire store, directory, verifier, hub, matcher... (see main.rs)
//!     Ok(())
//! }
//! ```

// Core modules
pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod store;

// Server modules
pub mod server;

// Re-export error types
pub use error::{Result, TandemError};

// Re-export configuration
pub use config::Config;

// Re-export protocol types
pub use protocol::{
    // Codec traits
    ClientCommand,
    Decodable,
    Encodable,
    // Frame types
    Frame,
    FrameCodec,
    FrameType,
    MAX_PAYLOAD_BYTES,
    // Message types
    messages::{
        Auth,
        AuthFailed,
        AuthOk,
        ChatEnd,
        ChatEnded,
        ChatId,
        ChatJoin,
        ChatLeave,
        ChatMessage,
        ChatMessageEvent,
        ChatRate,
        ChatRated,
        ChatRead,
        ChatReadEvent,
        ChatTyping,
        ChatTypingEvent,
        ConnectionRecovered,
        ContactRequest,
        ContactRequested,
        ContactRespond,
        ContactResponseStatus,
        ContactStatus,
        DesiredGender,
        ErrorEvent,
        Gender,
        Hello,
        HelloAck,
        Location,
        MatchedUser,
        STATS_ROOM,
        SearchCancel,
        SearchCriteria,
        SearchExpired,
        SearchId,
        SearchMatched,
        SearchStart,
        SearchState,
        SearchStats,
        SearchStatus,
        SubscribeStats,
        TelegramId,
        UnsubscribeStats,
        UserId,
        chat_room,
    },
};

// Re-export store types
pub use store::{
    Store,
    records::{ChatKind, ChatRecord, MatchedWith, Rating, SearchRecord, StoredMessage, User},
};

// Re-export directory seams
pub use directory::{MemoryDirectory, StoreTokenVerifier, TokenVerifier, UserDirectory};

// Re-export server types
pub use server::{
    BreakerConfig, ChatRouter, CircuitBreaker, ConnectionHub, Janitor, MatchServer, Matcher,
    StatsBroadcaster,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp_monotonic_enough() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        // Sanity: we are past 2020
        assert!(a > 1_577_836_800_000);
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 4433);
        assert_eq!(config.max_connections, 10_000);
    }
}
