//! Periodic expiry of dormant searches, idle chats and stale tokens

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::Result;
use crate::protocol::messages::{ChatEnded, chat_room};
use crate::server::hub::ConnectionHub;
use crate::server::matcher::Matcher;
use crate::store::Store;

/// Dormant searching records are swept on this cadence
const SEARCH_SWEEP_SECS: u64 = 30;

/// Expired chats are swept on this cadence
const CHAT_SWEEP_SECS: u64 = 60;

/// Token retention runs once a day
const TOKEN_SWEEP_SECS: u64 = 24 * 60 * 60;

/// Background sweeper for aged-out state
pub struct Janitor {
    store: Arc<Store>,
    hub: Arc<ConnectionHub>,
    matcher: Arc<Matcher>,
}

impl Janitor {
    pub fn new(store: Arc<Store>, hub: Arc<ConnectionHub>, matcher: Arc<Matcher>) -> Self {
        Self {
            store,
            hub,
            matcher,
        }
    }

    /// Spawn the three sweep loops; handles live as long as the server
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        {
            let janitor = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(SEARCH_SWEEP_SECS));
                loop {
                    interval.tick().await;
                    match janitor.matcher.expire_stale().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "expired dormant searches"),
                        Err(e) => warn!(error = %e, "search sweep failed"),
                    }
                }
            }));
        }

        {
            let janitor = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(CHAT_SWEEP_SECS));
                loop {
                    interval.tick().await;
                    match janitor.sweep_chats().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "expired idle chats"),
                        Err(e) => warn!(error = %e, "chat sweep failed"),
                    }
                }
            }));
        }

        {
            let janitor = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(TOKEN_SWEEP_SECS));
                loop {
                    interval.tick().await;
                    match janitor.store.purge_expired_tokens(current_timestamp()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "purged expired tokens"),
                        Err(e) => warn!(error = %e, "token sweep failed"),
                    }
                }
            }));
        }

        handles
    }

    /// Deactivate chats past their TTL and notify their rooms
    pub async fn sweep_chats(&self) -> Result<usize> {
        let expired = self.store.expire_chats(current_timestamp()).await?;
        for chat in &expired {
            debug!(chat = %chat.id, "chat expired");
            self.hub
                .broadcast_to_room(
                    &chat_room(&chat.id),
                    &ChatEnded {
                        chat_id: chat.id.clone(),
                        ended_by: None,
                        reason: Some("expired".to_string()),
                    },
                    None,
                )
                .await;
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, UserDirectory};
    use crate::protocol::frame::FrameType;
    use crate::server::breaker::{BreakerConfig, CircuitBreaker};
    use crate::server::connection::ConnectionCommand;
    use crate::server::stats::StatsBroadcaster;
    use crate::store::records::ChatRecord;
    use tokio::sync::mpsc;

    fn janitor() -> (Arc<Janitor>, Arc<Store>, Arc<ConnectionHub>) {
        let store = Arc::new(Store::new());
        let directory = Arc::new(MemoryDirectory::new());
        let hub = Arc::new(ConnectionHub::new(
            Duration::from_secs(120),
            Duration::from_secs(120),
        ));
        let stats = Arc::new(StatsBroadcaster::new(
            Arc::clone(&store),
            directory.clone() as Arc<dyn UserDirectory>,
            Arc::clone(&hub),
            Duration::from_secs(5),
            Duration::from_secs(2),
        ));
        let matcher = Arc::new(Matcher::new(
            Arc::clone(&store),
            directory as Arc<dyn UserDirectory>,
            Arc::clone(&hub),
            stats,
            Arc::new(CircuitBreaker::new("matcher", BreakerConfig::matcher())),
        ));
        (
            Arc::new(Janitor::new(
                Arc::clone(&store),
                Arc::clone(&hub),
                matcher,
            )),
            store,
            hub,
        )
    }

    #[tokio::test]
    async fn test_chat_sweep_notifies_room() {
        let (janitor, store, hub) = janitor();

        let mut chat = ChatRecord::anonymous(1, 2, 0);
        chat.expires_at = Some(1);
        let chat_id = chat.id.clone();
        store.insert_chat(chat).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("s1", 1, tx, None).await;
        hub.join_room("s1", &chat_room(&chat_id)).await;

        let swept = janitor.sweep_chats().await.unwrap();
        assert_eq!(swept, 1);

        let cmd = rx.try_recv().unwrap();
        let frame = match cmd {
            ConnectionCommand::Deliver(frame) => frame,
            other => panic!("unexpected command: {:?}", other),
        };
        assert_eq!(frame.kind, FrameType::ChatEnded);

        let event: ChatEnded = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(event.ended_by, None);
        assert_eq!(event.reason.as_deref(), Some("expired"));

        // A second sweep finds nothing
        assert_eq!(janitor.sweep_chats().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chat_sweep_skips_live_chats() {
        let (janitor, store, _hub) = janitor();

        let chat = ChatRecord::anonymous(1, 2, current_timestamp());
        store.insert_chat(chat).await.unwrap();

        assert_eq!(janitor.sweep_chats().await.unwrap(), 0);
    }
}
