//! User directory and token verification seams
//!
//! The matchmaker consumes users and session tokens; it never creates
//! them. Both collaborators are traits so the server can be wired to a
//! real user service in production and to in-memory fixtures in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::current_timestamp;
use crate::error::{Result, TandemError};
use crate::protocol::messages::{Gender, GenderCounts, UserId};
use crate::store::records::{StoredToken, User};
use crate::store::Store;

/// Read-through lookups and presence updates against the user base
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by id
    async fn user(&self, id: UserId) -> Result<Option<User>>;

    /// Flip the user's online flag
    async fn set_active(&self, id: UserId, active: bool) -> Result<()>;

    /// Refresh the user's lastActive stamp to now
    async fn touch_last_active(&self, id: UserId) -> Result<()>;

    /// Replace the user's aggregate rating
    async fn set_rating(&self, id: UserId, rating: f32) -> Result<()>;

    /// Count users with lastActive at or after `since`, grouped by gender
    async fn online_counts(&self, since: u64) -> Result<GenderCounts>;
}

/// Session-token validation
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a bearer token to a user id, or fail with an auth error
    async fn verify(&self, token: &str) -> Result<UserId>;
}

/// In-memory user directory
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, User>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a user (bootstrap and tests)
    pub async fn insert(&self, user: User) {
        let mut users = self.users.write().await;
        users.insert(user.id, user);
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn user(&self, id: UserId) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&id).cloned())
    }

    async fn set_active(&self, id: UserId, active: bool) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(&id) {
            user.is_active = active;
            user.last_active = current_timestamp();
        }
        Ok(())
    }

    async fn touch_last_active(&self, id: UserId) -> Result<()> {
        let mut users = self.users.write().await;
        if let Some(user) = users.get_mut(&id) {
            user.last_active = current_timestamp();
        }
        Ok(())
    }

    async fn set_rating(&self, id: UserId, rating: f32) -> Result<()> {
        let mut users = self.users.write().await;
        match users.get_mut(&id) {
            Some(user) => {
                user.rating = rating.clamp(0.0, 5.0);
                Ok(())
            }
            None => Err(TandemError::not_found("user")),
        }
    }

    async fn online_counts(&self, since: u64) -> Result<GenderCounts> {
        let users = self.users.read().await;

        let mut counts = GenderCounts::default();
        for user in users.values() {
            if user.last_active >= since {
                counts.t += 1;
                match user.gender {
                    Gender::Male => counts.m += 1,
                    Gender::Female => counts.f += 1,
                    Gender::Other => {}
                }
            }
        }
        Ok(counts)
    }
}

/// Token verifier backed by the store's token collection
pub struct StoreTokenVerifier {
    store: Arc<Store>,
}

impl StoreTokenVerifier {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a token (bootstrap and tests; issuance itself is external)
    pub async fn register(&self, token: &str, user_id: UserId, expires_at: u64) -> Result<()> {
        self.store
            .put_token(StoredToken {
                token: token.to_string(),
                user_id,
                expires_at,
            })
            .await
    }
}

#[async_trait]
impl TokenVerifier for StoreTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId> {
        let stored = self
            .store
            .token(token)
            .await?
            .ok_or_else(|| TandemError::auth("invalid token"))?;

        if stored.expires_at <= current_timestamp() {
            return Err(TandemError::auth("token expired"));
        }
        Ok(stored.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: UserId, gender: Gender, last_active: u64) -> User {
        User {
            id,
            telegram_id: id as i64,
            gender,
            age: 30,
            rating: 3.0,
            is_active: false,
            last_active,
        }
    }

    #[tokio::test]
    async fn test_directory_lookup_and_presence() {
        let directory = MemoryDirectory::new();
        directory.insert(user(1, Gender::Male, 0)).await;

        let found = directory.user(1).await.unwrap().unwrap();
        assert!(!found.is_active);

        directory.set_active(1, true).await.unwrap();
        let found = directory.user(1).await.unwrap().unwrap();
        assert!(found.is_active);
        assert!(found.last_active > 0);

        assert!(directory.user(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_rating_clamped() {
        let directory = MemoryDirectory::new();
        directory.insert(user(1, Gender::Female, 0)).await;

        directory.set_rating(1, 7.5).await.unwrap();
        let found = directory.user(1).await.unwrap().unwrap();
        assert_eq!(found.rating, 5.0);

        assert!(directory.set_rating(99, 3.0).await.is_err());
    }

    #[tokio::test]
    async fn test_online_counts_window() {
        let directory = MemoryDirectory::new();
        directory.insert(user(1, Gender::Male, 1_000)).await;
        directory.insert(user(2, Gender::Female, 2_000)).await;
        directory.insert(user(3, Gender::Female, 100)).await;

        let counts = directory.online_counts(1_000).await.unwrap();
        assert_eq!(counts.t, 2);
        assert_eq!(counts.m, 1);
        assert_eq!(counts.f, 1);
    }

    #[tokio::test]
    async fn test_token_verifier() {
        let store = Arc::new(Store::new());
        let verifier = StoreTokenVerifier::new(Arc::clone(&store));

        let far_future = current_timestamp() + 60_000;
        verifier.register("good", 7, far_future).await.unwrap();
        verifier.register("stale", 8, 1).await.unwrap();

        assert_eq!(verifier.verify("good").await.unwrap(), 7);

        let err = verifier.verify("stale").await;
        assert!(matches!(err, Err(TandemError::Auth(_))));

        let err = verifier.verify("unknown").await;
        assert!(matches!(err, Err(TandemError::Auth(_))));
    }
}
