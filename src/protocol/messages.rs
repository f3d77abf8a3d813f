//! Protocol message types for the matchmaker
//!
//! All message payloads that can be serialized/deserialized within frames.
//! Uses serde for JSON serialization (can be swapped for protobuf/flatbuffers).

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};

/// Unique identifier types
pub type UserId = u64;
pub type TelegramId = i64;
pub type ChatId = String;
pub type SearchId = String;

/// Age bounds accepted in search criteria
pub const MIN_AGE: u8 = 18;
pub const MAX_AGE: u8 = 100;

/// Geofence bounds in kilometers
pub const MIN_DISTANCE_KM: f64 = 1.0;
pub const MAX_DISTANCE_KM: f64 = 100.0;
pub const DEFAULT_DISTANCE_KM: f64 = 10.0;

/// Sentinel meaning "any rating is acceptable"
pub const RATING_ANY: f32 = -1.0;

/// Room holding every live-stats subscriber
pub const STATS_ROOM: &str = "search_stats_room";

/// Room name for a chat's fan-out
pub fn chat_room(chat_id: &str) -> String {
    format!("chat:{}", chat_id)
}

/// Gender of a user or search record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// A gender preference entry in search criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredGender {
    Male,
    Female,
    Any,
}

/// A geographic point as (longitude, latitude)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

/// Search criteria submitted with `search:start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    pub gender: Gender,
    pub age: u8,
    #[serde(default)]
    pub rating: Option<f32>,
    pub desired_gender: Vec<DesiredGender>,
    pub desired_age_min: u8,
    pub desired_age_max: u8,
    #[serde(default)]
    pub min_acceptable_rating: Option<f32>,
    #[serde(default)]
    pub use_geolocation: bool,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub max_distance: Option<f64>,
}

impl SearchCriteria {
    /// Validate all field constraints; returns the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.gender == Gender::Other {
            return Err(TandemError::validation(
                "search gender must be male or female",
            ));
        }
        if self.desired_gender.is_empty() {
            return Err(TandemError::validation("desiredGender must not be empty"));
        }
        if self.age < MIN_AGE || self.age > MAX_AGE {
            return Err(TandemError::validation(format!(
                "age must be in [{}, {}]",
                MIN_AGE, MAX_AGE
            )));
        }
        if self.desired_age_min < MIN_AGE || self.desired_age_max > MAX_AGE {
            return Err(TandemError::validation(format!(
                "desired age bounds must be in [{}, {}]",
                MIN_AGE, MAX_AGE
            )));
        }
        if self.desired_age_min > self.desired_age_max {
            return Err(TandemError::validation(
                "desiredAgeMin must not exceed desiredAgeMax",
            ));
        }
        if self.use_geolocation && self.location.is_none() {
            return Err(TandemError::validation(
                "location is required when useGeolocation is set",
            ));
        }
        if !self.use_geolocation && self.location.is_some() {
            return Err(TandemError::validation(
                "location must be absent when useGeolocation is not set",
            ));
        }
        if let Some(distance) = self.max_distance {
            if !(MIN_DISTANCE_KM..=MAX_DISTANCE_KM).contains(&distance) {
                return Err(TandemError::validation(format!(
                    "maxDistance must be in [{}, {}] km",
                    MIN_DISTANCE_KM, MAX_DISTANCE_KM
                )));
            }
        }
        if let Some(location) = &self.location {
            if !(-180.0..=180.0).contains(&location.longitude)
                || !(-90.0..=90.0).contains(&location.latitude)
            {
                return Err(TandemError::validation("location out of range"));
            }
        }
        Ok(())
    }

    /// Effective geofence radius, defaulting when geolocation is on
    pub fn effective_max_distance(&self) -> Option<f64> {
        if self.use_geolocation {
            Some(self.max_distance.unwrap_or(DEFAULT_DISTANCE_KM))
        } else {
            None
        }
    }
}

// =============================================================================
// Control Messages (0x00 - 0x0F)
// =============================================================================

/// Initial handshake from client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Protocol version
    pub version: u32,
    /// Session id held before a disconnect, when the client is reconnecting
    #[serde(default)]
    pub previous_session: Option<String>,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            version: 1,
            previous_session: None,
        }
    }
}

/// Server response to Hello
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAck {
    /// Server protocol version
    pub version: u32,
    /// Session ID assigned to this connection
    pub session_id: String,
}

/// Authentication request
///
/// Token sources are resolved in priority order: the `token` field, a
/// `token` header, then `Authorization: Bearer <token>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl Auth {
    /// Resolve the bearer token from its possible sources
    pub fn bearer_token(&self) -> Option<String> {
        if let Some(token) = &self.token {
            if !token.is_empty() {
                return Some(token.clone());
            }
        }

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("token") && !value.is_empty() {
                return Some(value.clone());
            }
        }

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("authorization") {
                if let Some(token) = value.strip_prefix("Bearer ") {
                    if !token.is_empty() {
                        return Some(token.to_string());
                    }
                }
            }
        }

        None
    }
}

/// Successful authentication response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOk {
    /// Authenticated user ID
    pub user_id: UserId,
    /// Session ID assigned to this connection
    pub session_id: String,
    /// Whether a previous session's rooms were restored
    pub recovered: bool,
    /// Rooms this session starts out joined to
    pub rooms: Vec<String>,
}

/// Authentication failure response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailed {
    /// Error code
    pub code: u32,
    /// Human-readable error message
    pub message: String,
}

/// Ping message for keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for RTT measurement)
    pub timestamp: u64,
}

/// Pong response to Ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back the timestamp from Ping
    pub timestamp: u64,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    /// Reason for disconnect
    pub reason: String,
}

/// Client acknowledgment of the completed handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionAck {}

/// Session recovery notification after a reconnect within the window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecovered {
    /// Rooms restored onto the new session
    pub rooms: Vec<String>,
}

// =============================================================================
// Search Commands (0x10 - 0x1F) - Client -> Server
// =============================================================================

/// Begin searching for a partner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStart {
    pub criteria: SearchCriteria,
}

/// Cancel the active search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchCancel {}

/// Subscribe to live search statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeStats {}

/// Unsubscribe from live search statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeStats {}

// =============================================================================
// Chat Commands (0x20 - 0x2F) - Client -> Server
// =============================================================================

/// Join a chat room for fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatJoin {
    pub chat_id: ChatId,
}

/// Leave a chat room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLeave {
    pub chat_id: ChatId,
}

/// Send a message to a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub chat_id: ChatId,
    pub content: String,
}

/// Typing indicator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTyping {
    pub chat_id: ChatId,
}

/// Read receipt: everything from the partner up to `timestamp` is read
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRead {
    pub chat_id: ChatId,
    pub timestamp: u64,
}

/// End a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnd {
    pub chat_id: ChatId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Rate the partner of a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRate {
    pub chat_id: ChatId,
    pub score: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

// =============================================================================
// Contact Commands (0x30 - 0x3F) - Client -> Server
// =============================================================================

/// Contact-exchange response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactResponseStatus {
    Accepted,
    Declined,
    Blocked,
}

/// Ask the partner of a chat to exchange contacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequest {
    pub to: UserId,
    pub chat_id: ChatId,
}

/// Answer a contact-exchange request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRespond {
    /// The user that asked
    pub user_id: UserId,
    pub status: ContactResponseStatus,
}

// =============================================================================
// Search Events (0x40 - 0x4F) - Server -> Client
// =============================================================================

/// Search record status carried by status events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    Searching,
    Matched,
    Cancelled,
    Expired,
}

/// Immediate reply to `search:start` / `search:cancel`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStatus {
    pub status: SearchState,
}

/// The matched partner as seen by one side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedUser {
    pub telegram_id: TelegramId,
    pub gender: Gender,
    pub age: u8,
    pub chat_id: ChatId,
}

/// A pair was formed; carries the *other* participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatched {
    pub matched_user: MatchedUser,
}

/// The search aged out
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchExpired {}

/// Per-gender counters inside the stats payload
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenderCounts {
    pub t: u64,
    pub m: u64,
    pub f: u64,
}

/// Average search durations in the last 24 h, milliseconds
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvgSearchTime {
    pub t: u64,
    pub m: u64,
    pub f: u64,
    pub matches_24h: u64,
}

/// Live search statistics broadcast to subscribers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    pub t: u64,
    pub m: u64,
    pub f: u64,
    pub online: GenderCounts,
    pub avg_search_time: AvgSearchTime,
}

// =============================================================================
// Chat Events (0x50 - 0x5F) - Server -> Client
// =============================================================================

/// A message delivered to a chat room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEvent {
    pub chat_id: ChatId,
    pub content: String,
    pub user_id: UserId,
}

/// A participant is typing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTypingEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
}

/// A participant read messages up to a timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReadEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub timestamp: u64,
}

/// A chat was ended, by a participant or by expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnded {
    pub chat_id: ChatId,
    /// None when the chat expired rather than being ended by a participant
    pub ended_by: Option<UserId>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The partner submitted a rating
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRated {
    pub chat_id: ChatId,
    pub rated_by: UserId,
    pub score: u8,
}

// =============================================================================
// Contact Events (0x60 - 0x6F) - Server -> Client
// =============================================================================

/// A contact-exchange request arrived
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRequested {
    pub from: UserId,
    pub chat_id: ChatId,
}

/// A contact-exchange request was answered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactStatus {
    pub user_id: UserId,
    pub status: ContactResponseStatus,
}

// =============================================================================
// Error Message (0xFF)
// =============================================================================

/// Error response sent only to the offending caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl ErrorEvent {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn from_error(err: &TandemError) -> Self {
        // Internal details never leak to clients
        if matches!(err, TandemError::Internal(_)) {
            return Self::new(err.code(), "internal");
        }
        Self::new(err.code(), err.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> SearchCriteria {
        SearchCriteria {
            gender: Gender::Male,
            age: 25,
            rating: None,
            desired_gender: vec![DesiredGender::Female],
            desired_age_min: 20,
            desired_age_max: 30,
            min_acceptable_rating: None,
            use_geolocation: false,
            location: None,
            max_distance: None,
        }
    }

    #[test]
    fn test_criteria_valid() {
        assert!(criteria().validate().is_ok());
    }

    #[test]
    fn test_criteria_rejects_empty_desired_gender() {
        let mut c = criteria();
        c.desired_gender.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_criteria_rejects_inverted_age_bounds() {
        let mut c = criteria();
        c.desired_age_min = 40;
        c.desired_age_max = 30;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_criteria_rejects_underage() {
        let mut c = criteria();
        c.age = 17;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_criteria_location_iff_geolocation() {
        let mut c = criteria();
        c.use_geolocation = true;
        assert!(c.validate().is_err());

        c.location = Some(Location {
            longitude: 30.52,
            latitude: 50.45,
        });
        assert!(c.validate().is_ok());

        c.use_geolocation = false;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_criteria_distance_bounds() {
        let mut c = criteria();
        c.use_geolocation = true;
        c.location = Some(Location {
            longitude: 0.0,
            latitude: 0.0,
        });
        c.max_distance = Some(0.5);
        assert!(c.validate().is_err());

        c.max_distance = Some(150.0);
        assert!(c.validate().is_err());

        c.max_distance = Some(10.0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_effective_max_distance_defaults() {
        let mut c = criteria();
        assert_eq!(c.effective_max_distance(), None);

        c.use_geolocation = true;
        c.location = Some(Location {
            longitude: 0.0,
            latitude: 0.0,
        });
        assert_eq!(c.effective_max_distance(), Some(DEFAULT_DISTANCE_KM));

        c.max_distance = Some(42.0);
        assert_eq!(c.effective_max_distance(), Some(42.0));
    }

    #[test]
    fn test_bearer_token_priority() {
        let auth = Auth {
            token: Some("field-token".to_string()),
            headers: vec![
                ("token".to_string(), "header-token".to_string()),
                ("Authorization".to_string(), "Bearer auth-token".to_string()),
            ],
        };
        assert_eq!(auth.bearer_token().as_deref(), Some("field-token"));

        let auth = Auth {
            token: None,
            headers: vec![
                ("Token".to_string(), "header-token".to_string()),
                ("Authorization".to_string(), "Bearer auth-token".to_string()),
            ],
        };
        assert_eq!(auth.bearer_token().as_deref(), Some("header-token"));

        let auth = Auth {
            token: None,
            headers: vec![("authorization".to_string(), "Bearer auth-token".to_string())],
        };
        assert_eq!(auth.bearer_token().as_deref(), Some("auth-token"));

        let auth = Auth::default();
        assert!(auth.bearer_token().is_none());
    }

    #[test]
    fn test_serialize_criteria_field_names() {
        let c = criteria();
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("desiredGender"));
        assert!(json.contains("desiredAgeMin"));
        assert!(json.contains("useGeolocation"));

        let decoded: SearchCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.age, 25);
        assert_eq!(decoded.desired_gender, vec![DesiredGender::Female]);
    }

    #[test]
    fn test_serialize_stats_short_keys() {
        let stats = SearchStats {
            t: 10,
            m: 6,
            f: 4,
            online: GenderCounts { t: 20, m: 12, f: 8 },
            avg_search_time: AvgSearchTime {
                t: 4500,
                m: 5000,
                f: 4000,
                matches_24h: 7,
            },
        };

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"t\":10"));
        assert!(json.contains("matches24h"));

        let decoded: SearchStats = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.online.m, 12);
        assert_eq!(decoded.avg_search_time.matches_24h, 7);
    }

    #[test]
    fn test_error_event_masks_internal() {
        let err = TandemError::internal("stack details");
        let event = ErrorEvent::from_error(&err);
        assert_eq!(event.message, "internal");

        let err = TandemError::precondition("chat already ended");
        let event = ErrorEvent::from_error(&err);
        assert_eq!(event.message, "chat already ended");
    }
}
