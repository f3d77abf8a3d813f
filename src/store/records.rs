//! Persisted record models: users, searches, chats, ratings, tokens

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::messages::{
    ChatId, DesiredGender, Gender, Location, SearchCriteria, SearchId, SearchState, TelegramId,
    UserId,
};

/// A search record is auto-expired this long after creation
pub const SEARCH_TTL_MS: u64 = 30 * 60 * 1000;

/// Anonymous chats expire this long after creation
pub const ANONYMOUS_CHAT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// A user as seen through the directory (read-only for the core)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub telegram_id: TelegramId,
    pub gender: Gender,
    pub age: u8,
    pub rating: f32,
    pub is_active: bool,
    /// Unix millis of the last presence refresh
    pub last_active: u64,
}

/// The pairing outcome stamped onto a matched search record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedWith {
    pub user_id: UserId,
    pub telegram_id: TelegramId,
    pub chat_id: ChatId,
}

/// A declared intent to be paired
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub id: SearchId,
    pub user_id: UserId,
    pub telegram_id: TelegramId,
    pub status: SearchState,
    pub gender: Gender,
    pub age: u8,
    pub rating: f32,
    pub desired_gender: Vec<DesiredGender>,
    pub desired_age_min: u8,
    pub desired_age_max: u8,
    /// -1.0 means any rating is acceptable
    pub min_acceptable_rating: f32,
    pub use_geolocation: bool,
    pub location: Option<Location>,
    pub max_distance_km: Option<f64>,
    /// Present iff status is Matched
    pub matched_with: Option<MatchedWith>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SearchRecord {
    /// Build a fresh searching record from a user and validated criteria
    pub fn new(user: &User, criteria: &SearchCriteria, now: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            telegram_id: user.telegram_id,
            status: SearchState::Searching,
            gender: criteria.gender,
            age: criteria.age,
            rating: criteria.rating.unwrap_or(user.rating),
            desired_gender: criteria.desired_gender.clone(),
            desired_age_min: criteria.desired_age_min,
            desired_age_max: criteria.desired_age_max,
            min_acceptable_rating: criteria
                .min_acceptable_rating
                .unwrap_or(crate::protocol::messages::RATING_ANY),
            use_geolocation: criteria.use_geolocation,
            location: criteria.location,
            max_distance_km: criteria.effective_max_distance(),
            matched_with: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal states are sinks
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, SearchState::Searching)
    }

    /// Age of the record relative to `now`, in milliseconds
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Time spent searching before reaching a terminal state
    pub fn search_duration_ms(&self) -> u64 {
        self.updated_at.saturating_sub(self.created_at)
    }
}

/// Chat record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Anonymous,
    Permanent,
}

/// A single stored message inside a chat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub sender: UserId,
    pub content: String,
    pub timestamp: u64,
    pub is_read: bool,
}

/// An ephemeral two-party chat room record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: ChatId,
    pub participants: [UserId; 2],
    pub kind: ChatKind,
    pub is_active: bool,
    /// Set for anonymous chats: created_at + 24 h
    pub expires_at: Option<u64>,
    pub messages: Vec<StoredMessage>,
    pub last_message: Option<String>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub ended_by: Option<UserId>,
    pub end_reason: Option<String>,
}

impl ChatRecord {
    /// Create an anonymous chat between two users
    pub fn anonymous(a: UserId, b: UserId, now: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            participants: [a, b],
            kind: ChatKind::Anonymous,
            is_active: true,
            expires_at: Some(now + ANONYMOUS_CHAT_TTL_MS),
            messages: Vec::new(),
            last_message: None,
            started_at: now,
            ended_at: None,
            ended_by: None,
            end_reason: None,
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    /// The partner of `user_id`; None when the user is not a participant
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// A rating submitted by one chat participant about the other
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub id: String,
    pub rated_user_id: UserId,
    pub rater_user_id: UserId,
    pub chat_id: ChatId,
    pub score: u8,
    pub comment: Option<String>,
    pub created_at: u64,
}

impl Rating {
    pub fn new(
        rated_user_id: UserId,
        rater_user_id: UserId,
        chat_id: ChatId,
        score: u8,
        comment: Option<String>,
        now: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rated_user_id,
            rater_user_id,
            chat_id,
            score,
            comment,
            created_at: now,
        }
    }
}

/// A session token with its expiry, held for the verifier seam
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredToken {
    pub token: String,
    pub user_id: UserId,
    pub expires_at: u64,
}
