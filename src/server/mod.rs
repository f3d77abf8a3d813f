//! Matchmaker server implementation
//!
//! One handler task per QUIC connection feeds [`ServerEvent`]s into the
//! orchestrating [`MatchServer`], which drives the matcher, chat router
//! and stats broadcaster and fans results back out through the
//! [`ConnectionHub`].

pub mod breaker;
pub mod chat_router;
pub mod connection;
pub mod hub;
pub mod janitor;
pub mod match_server;
pub mod matcher;
pub mod stats;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use chat_router::ChatRouter;
pub use connection::{ConnectionCommand, ConnectionConfig, ConnectionHandler, ServerEvent};
pub use hub::{ConnectionHub, SessionEntry};
pub use janitor::Janitor;
pub use match_server::MatchServer;
pub use matcher::{Matcher, SearchOutcome};
pub use stats::{StatsAction, StatsBroadcaster, StatsSnapshot};
