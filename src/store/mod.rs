//! Durable records of searches, chats and ratings
//!
//! This module owns the persisted state the matchmaker operates on. All
//! multi-record invariants (one searching record per user, unique rating
//! per rater and chat) are enforced here, under a single writer per
//! collection. Transitions are compare-and-set: callers name the state
//! they expect and the update fails cleanly when another writer got
//! there first.

pub mod records;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::current_timestamp;
use crate::error::{Result, TandemError};
use crate::protocol::messages::{ChatId, Gender, GenderCounts, SearchId, SearchState, UserId};
use records::{ChatRecord, MatchedWith, Rating, SearchRecord, StoredMessage, StoredToken};

/// Search collection plus its status indexes, guarded as one unit so a
/// compare-and-set cannot observe a half-updated index
#[derive(Debug, Default)]
struct SearchTable {
    records: HashMap<SearchId, SearchRecord>,
    /// Users with a record currently in Searching
    searching_by_user: HashMap<UserId, SearchId>,
    /// Most recent record per user, regardless of status
    latest_by_user: HashMap<UserId, SearchId>,
}

/// Aggregates over matched records in a time window
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAggregates {
    pub avg_total_ms: u64,
    pub avg_male_ms: u64,
    pub avg_female_ms: u64,
    pub matches: u64,
}

/// In-process store for searches, chats, ratings and tokens
pub struct Store {
    searches: RwLock<SearchTable>,
    chats: RwLock<HashMap<ChatId, ChatRecord>>,
    ratings: RwLock<HashMap<String, Rating>>,
    rating_index: RwLock<HashSet<(UserId, ChatId)>>,
    tokens: RwLock<HashMap<String, StoredToken>>,
    available: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Self {
            searches: RwLock::new(SearchTable::default()),
            chats: RwLock::new(HashMap::new()),
            ratings: RwLock::new(HashMap::new()),
            rating_index: RwLock::new(HashSet::new()),
            tokens: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Health probe; fails while the store is marked unavailable
    pub fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    /// Maintenance toggle; while unavailable every operation fails with
    /// a transient error so circuit breakers can observe the outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TandemError::store_unavailable("store is unreachable"))
        }
    }

    // =========================================================================
    // Searches
    // =========================================================================

    /// Insert a fresh searching record for its user
    pub async fn insert_search(&self, record: SearchRecord) -> Result<()> {
        self.ensure_available()?;

        let mut table = self.searches.write().await;
        if table.searching_by_user.contains_key(&record.user_id) {
            return Err(TandemError::precondition(
                "user already has an active search",
            ));
        }

        table
            .searching_by_user
            .insert(record.user_id, record.id.clone());
        table
            .latest_by_user
            .insert(record.user_id, record.id.clone());
        table.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Get a search record by id
    pub async fn search(&self, id: &str) -> Result<Option<SearchRecord>> {
        self.ensure_available()?;
        let table = self.searches.read().await;
        Ok(table.records.get(id).cloned())
    }

    /// The user's record currently in Searching, if any
    pub async fn active_search(&self, user_id: UserId) -> Result<Option<SearchRecord>> {
        self.ensure_available()?;
        let table = self.searches.read().await;
        Ok(table
            .searching_by_user
            .get(&user_id)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    /// The user's most recent record regardless of status
    pub async fn latest_search(&self, user_id: UserId) -> Result<Option<SearchRecord>> {
        self.ensure_available()?;
        let table = self.searches.read().await;
        Ok(table
            .latest_by_user
            .get(&user_id)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    /// Compare-and-set transition of a search record
    ///
    /// Returns Ok(false) when the record's status no longer equals `from`
    /// (another writer won the race); the caller decides whether that
    /// means retry, rollback or no-op.
    pub async fn transition_search(
        &self,
        id: &str,
        from: SearchState,
        to: SearchState,
        matched_with: Option<MatchedWith>,
    ) -> Result<bool> {
        self.ensure_available()?;

        let mut table = self.searches.write().await;
        let record = match table.records.get_mut(id) {
            Some(r) => r,
            None => return Err(TandemError::not_found("search")),
        };

        if record.status != from {
            return Ok(false);
        }

        record.status = to;
        record.matched_with = matched_with;
        record.updated_at = current_timestamp();
        let user_id = record.user_id;

        match (from, to) {
            (SearchState::Searching, SearchState::Searching) => {}
            (SearchState::Searching, _) => {
                table.searching_by_user.remove(&user_id);
            }
            (_, SearchState::Searching) => {
                table.searching_by_user.insert(user_id, id.to_string());
            }
            _ => {}
        }

        Ok(true)
    }

    /// Snapshot of all records currently in Searching
    pub async fn searching_snapshot(&self) -> Result<Vec<SearchRecord>> {
        self.ensure_available()?;
        let table = self.searches.read().await;
        Ok(table
            .searching_by_user
            .values()
            .filter_map(|id| table.records.get(id))
            .cloned()
            .collect())
    }

    /// Transition every searching record created before `cutoff` to Expired
    pub async fn expire_searches(&self, cutoff: u64) -> Result<Vec<SearchRecord>> {
        self.ensure_available()?;

        let mut table = self.searches.write().await;
        let table = &mut *table;
        let stale: Vec<SearchId> = table
            .searching_by_user
            .values()
            .filter(|id| {
                table
                    .records
                    .get(*id)
                    .map(|r| r.created_at <= cutoff)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let now = current_timestamp();
        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(record) = table.records.get_mut(&id) {
                record.status = SearchState::Expired;
                record.updated_at = now;
                table.searching_by_user.remove(&record.user_id);
                expired.push(record.clone());
            }
        }

        Ok(expired)
    }

    /// Count searching records, grouped by gender
    pub async fn searching_counts(&self) -> Result<GenderCounts> {
        self.ensure_available()?;
        let table = self.searches.read().await;

        let mut counts = GenderCounts::default();
        for id in table.searching_by_user.values() {
            if let Some(record) = table.records.get(id) {
                counts.t += 1;
                match record.gender {
                    Gender::Male => counts.m += 1,
                    Gender::Female => counts.f += 1,
                    Gender::Other => {}
                }
            }
        }
        Ok(counts)
    }

    /// Average search duration and count of matches completed since `since`
    pub async fn match_aggregates(&self, since: u64) -> Result<MatchAggregates> {
        self.ensure_available()?;
        let table = self.searches.read().await;

        let mut total = (0u64, 0u64);
        let mut male = (0u64, 0u64);
        let mut female = (0u64, 0u64);

        for record in table.records.values() {
            if record.status != SearchState::Matched || record.updated_at < since {
                continue;
            }
            let duration = record.search_duration_ms();
            total.0 += duration;
            total.1 += 1;
            match record.gender {
                Gender::Male => {
                    male.0 += duration;
                    male.1 += 1;
                }
                Gender::Female => {
                    female.0 += duration;
                    female.1 += 1;
                }
                Gender::Other => {}
            }
        }

        let avg = |(sum, n): (u64, u64)| if n == 0 { 0 } else { sum / n };
        Ok(MatchAggregates {
            avg_total_ms: avg(total),
            avg_male_ms: avg(male),
            avg_female_ms: avg(female),
            // Each match produces two matched records
            matches: total.1 / 2,
        })
    }

    // =========================================================================
    // Chats
    // =========================================================================

    pub async fn insert_chat(&self, chat: ChatRecord) -> Result<()> {
        self.ensure_available()?;
        let mut chats = self.chats.write().await;
        chats.insert(chat.id.clone(), chat);
        Ok(())
    }

    pub async fn chat(&self, id: &str) -> Result<Option<ChatRecord>> {
        self.ensure_available()?;
        let chats = self.chats.read().await;
        Ok(chats.get(id).cloned())
    }

    /// Number of chat records held
    pub async fn chat_count(&self) -> usize {
        self.chats.read().await.len()
    }

    /// Remove a chat record entirely (pair-creation rollback)
    pub async fn delete_chat(&self, id: &str) -> Result<()> {
        self.ensure_available()?;
        let mut chats = self.chats.write().await;
        chats.remove(id);
        Ok(())
    }

    /// Append a message to an active chat and update its preview
    pub async fn append_message(&self, chat_id: &str, message: StoredMessage) -> Result<()> {
        self.ensure_available()?;

        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(chat_id)
            .ok_or_else(|| TandemError::not_found("chat"))?;

        if !chat.is_active {
            return Err(TandemError::precondition("chat already ended"));
        }

        chat.last_message = Some(message.content.clone());
        chat.messages.push(message);
        Ok(())
    }

    /// Mark partner messages up to `timestamp` as read; returns how many changed
    pub async fn mark_read(&self, chat_id: &str, reader: UserId, timestamp: u64) -> Result<u64> {
        self.ensure_available()?;

        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(chat_id)
            .ok_or_else(|| TandemError::not_found("chat"))?;

        let mut changed = 0;
        for message in chat.messages.iter_mut() {
            if message.sender != reader && message.timestamp <= timestamp && !message.is_read {
                message.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// End an active chat; fails when it has already ended
    pub async fn end_chat(
        &self,
        chat_id: &str,
        ended_by: Option<UserId>,
        reason: Option<String>,
    ) -> Result<ChatRecord> {
        self.ensure_available()?;

        let mut chats = self.chats.write().await;
        let chat = chats
            .get_mut(chat_id)
            .ok_or_else(|| TandemError::not_found("chat"))?;

        if !chat.is_active {
            return Err(TandemError::precondition("chat already ended"));
        }

        chat.is_active = false;
        chat.ended_at = Some(current_timestamp());
        chat.ended_by = ended_by;
        chat.end_reason = reason;
        Ok(chat.clone())
    }

    /// Deactivate chats whose TTL has elapsed; returns the affected records
    pub async fn expire_chats(&self, now: u64) -> Result<Vec<ChatRecord>> {
        self.ensure_available()?;

        let mut chats = self.chats.write().await;
        let mut expired = Vec::new();
        for chat in chats.values_mut() {
            if chat.is_active && chat.expires_at.map(|t| t <= now).unwrap_or(false) {
                chat.is_active = false;
                chat.ended_at = Some(now);
                chat.end_reason = Some("expired".to_string());
                expired.push(chat.clone());
            }
        }
        Ok(expired)
    }

    // =========================================================================
    // Ratings
    // =========================================================================

    /// Insert a rating; at most one per rater per chat
    pub async fn insert_rating(&self, rating: Rating) -> Result<()> {
        self.ensure_available()?;

        let key = (rating.rater_user_id, rating.chat_id.clone());
        let mut index = self.rating_index.write().await;
        if index.contains(&key) {
            return Err(TandemError::precondition("chat already rated"));
        }
        index.insert(key);

        let mut ratings = self.ratings.write().await;
        ratings.insert(rating.id.clone(), rating);
        Ok(())
    }

    pub async fn has_rating(&self, rater: UserId, chat_id: &str) -> Result<bool> {
        self.ensure_available()?;
        let index = self.rating_index.read().await;
        Ok(index.contains(&(rater, chat_id.to_string())))
    }

    /// Arithmetic mean of all scores submitted about a user
    pub async fn average_rating(&self, rated_user: UserId) -> Result<Option<f32>> {
        self.ensure_available()?;
        let ratings = self.ratings.read().await;

        let mut sum = 0u32;
        let mut count = 0u32;
        for rating in ratings.values() {
            if rating.rated_user_id == rated_user {
                sum += rating.score as u32;
                count += 1;
            }
        }

        if count == 0 {
            Ok(None)
        } else {
            Ok(Some(sum as f32 / count as f32))
        }
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    pub async fn put_token(&self, token: StoredToken) -> Result<()> {
        self.ensure_available()?;
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.token.clone(), token);
        Ok(())
    }

    pub async fn token(&self, token: &str) -> Result<Option<StoredToken>> {
        self.ensure_available()?;
        let tokens = self.tokens.read().await;
        Ok(tokens.get(token).cloned())
    }

    /// Drop tokens past their expiry; returns how many were removed
    pub async fn purge_expired_tokens(&self, now: u64) -> Result<usize> {
        self.ensure_available()?;
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now);
        Ok(before - tokens.len())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
