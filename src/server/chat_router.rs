//! Chat event routing: message, typing, read, end and rate
//!
//! Every operation validates the caller against the chat record's
//! participants (and liveness where it matters) before touching the
//! store or fanning out to the room. Violations surface as errors to
//! the caller only; the room never sees them.

use std::sync::Arc;

use tracing::{debug, info};

use crate::current_timestamp;
use crate::directory::UserDirectory;
use crate::error::{Result, TandemError};
use crate::protocol::messages::{
    ChatEnded, ChatMessageEvent, ChatRated, ChatReadEvent, ChatTypingEvent, UserId, chat_room,
};
use crate::server::breaker::CircuitBreaker;
use crate::server::hub::ConnectionHub;
use crate::store::Store;
use crate::store::records::{ChatRecord, Rating, StoredMessage};

/// Router for chat-scoped events
pub struct ChatRouter {
    store: Arc<Store>,
    directory: Arc<dyn UserDirectory>,
    hub: Arc<ConnectionHub>,
    breaker: Arc<CircuitBreaker>,
}

impl ChatRouter {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<dyn UserDirectory>,
        hub: Arc<ConnectionHub>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            directory,
            hub,
            breaker,
        }
    }

    /// Load a chat and require the caller to be one of its participants
    async fn participant_chat(&self, chat_id: &str, user_id: UserId) -> Result<ChatRecord> {
        let chat = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat_id = chat_id.to_string();
                async move { store.chat(&chat_id).await }
            })
            .await?
            .ok_or_else(|| TandemError::not_found("chat"))?;

        if !chat.is_participant(user_id) {
            return Err(TandemError::precondition("not a chat participant"));
        }
        Ok(chat)
    }

    /// `chat:join` - add the session to the chat's room
    pub async fn join(&self, session_id: &str, user_id: UserId, chat_id: &str) -> Result<()> {
        self.participant_chat(chat_id, user_id).await?;
        self.hub.join_room(session_id, &chat_room(chat_id)).await;
        debug!(user = user_id, chat = chat_id, "joined chat room");
        Ok(())
    }

    /// `chat:leave` - drop the session from the chat's room
    pub async fn leave(&self, session_id: &str, chat_id: &str) {
        self.hub.leave_room(session_id, &chat_room(chat_id)).await;
    }

    /// `chat:message` - append to the record and fan out to the room
    pub async fn message(&self, user_id: UserId, chat_id: &str, content: &str) -> Result<()> {
        if content.is_empty() {
            return Err(TandemError::validation("message content must not be empty"));
        }

        let chat = self.participant_chat(chat_id, user_id).await?;
        if !chat.is_active {
            return Err(TandemError::precondition("chat already ended"));
        }

        let received_at = current_timestamp();
        let message = StoredMessage {
            sender: user_id,
            content: content.to_string(),
            timestamp: received_at,
            is_read: false,
        };

        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat_id = chat_id.to_string();
                let message = message.clone();
                async move { store.append_message(&chat_id, message).await }
            })
            .await?;

        self.hub
            .broadcast_to_room(
                &chat_room(chat_id),
                &ChatMessageEvent {
                    chat_id: chat_id.to_string(),
                    content: content.to_string(),
                    user_id,
                },
                None,
            )
            .await;

        debug!(
            chat = chat_id,
            sender = user_id,
            latency_ms = current_timestamp().saturating_sub(received_at),
            "message delivered"
        );
        Ok(())
    }

    /// `chat:typing` - notify the room, excluding the sender
    pub async fn typing(&self, user_id: UserId, chat_id: &str) -> Result<()> {
        self.participant_chat(chat_id, user_id).await?;

        self.hub
            .broadcast_to_room(
                &chat_room(chat_id),
                &ChatTypingEvent {
                    chat_id: chat_id.to_string(),
                    user_id,
                },
                Some(user_id),
            )
            .await;
        Ok(())
    }

    /// `chat:read` - mark partner messages up to the timestamp as read
    pub async fn read(&self, user_id: UserId, chat_id: &str, timestamp: u64) -> Result<()> {
        self.participant_chat(chat_id, user_id).await?;

        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat_id = chat_id.to_string();
                async move { store.mark_read(&chat_id, user_id, timestamp).await }
            })
            .await?;

        self.hub
            .broadcast_to_room(
                &chat_room(chat_id),
                &ChatReadEvent {
                    chat_id: chat_id.to_string(),
                    user_id,
                    timestamp,
                },
                None,
            )
            .await;
        Ok(())
    }

    /// `chat:end` - deactivate the chat and notify the room
    pub async fn end(&self, user_id: UserId, chat_id: &str, reason: Option<String>) -> Result<()> {
        let chat = self.participant_chat(chat_id, user_id).await?;
        if !chat.is_active {
            return Err(TandemError::precondition("chat already ended"));
        }

        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat_id = chat_id.to_string();
                let reason = reason.clone();
                async move { store.end_chat(&chat_id, Some(user_id), reason).await }
            })
            .await?;

        info!(chat = chat_id, ended_by = user_id, "chat ended");
        self.hub
            .broadcast_to_room(
                &chat_room(chat_id),
                &ChatEnded {
                    chat_id: chat_id.to_string(),
                    ended_by: Some(user_id),
                    reason,
                },
                None,
            )
            .await;
        Ok(())
    }

    /// `chat:rate` - insert the rating, recompute the partner's mean and
    /// notify the rated participant
    pub async fn rate(
        &self,
        user_id: UserId,
        chat_id: &str,
        score: u8,
        comment: Option<String>,
    ) -> Result<()> {
        if !(1..=5).contains(&score) {
            return Err(TandemError::validation("score must be in [1, 5]"));
        }

        let chat = self.participant_chat(chat_id, user_id).await?;
        let rated_user = chat
            .other_participant(user_id)
            .ok_or_else(|| TandemError::precondition("not a chat participant"))?;

        if self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat_id = chat_id.to_string();
                async move { store.has_rating(user_id, &chat_id).await }
            })
            .await?
        {
            return Err(TandemError::precondition("chat already rated"));
        }

        let rating = Rating::new(
            rated_user,
            user_id,
            chat_id.to_string(),
            score,
            comment,
            current_timestamp(),
        );
        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let rating = rating.clone();
                async move { store.insert_rating(rating).await }
            })
            .await?;

        // Recompute the mean and push it back into the directory
        if let Some(average) = self.store.average_rating(rated_user).await? {
            self.directory.set_rating(rated_user, average).await?;
        }

        info!(
            chat = chat_id,
            rater = user_id,
            rated = rated_user,
            score,
            "rating submitted"
        );
        self.hub
            .send_to_user(
                rated_user,
                &ChatRated {
                    chat_id: chat_id.to_string(),
                    rated_by: user_id,
                    score,
                },
            )
            .await;
        Ok(())
    }
}
