//! Connection hub: authenticated sessions, rooms and fan-out
//!
//! Owns the set of live sessions, the per-user session and room maps,
//! and the reconnection bookkeeping. A user may hold several sessions
//! at once; the per-user room set is the union over sessions and is
//! what a reconnecting session gets restored to.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::codec::Encodable;
use crate::protocol::frame::Frame;
use crate::protocol::messages::UserId;
use crate::server::connection::ConnectionCommand;

/// One authenticated real-time connection
#[derive(Debug)]
pub struct SessionEntry {
    pub session_id: String,
    pub user_id: UserId,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    pub rooms: HashSet<String>,
    pub connected_at: Instant,
    pub reconnected_from: Option<String>,
}

/// Per-user room union, kept alive across short disconnects
#[derive(Debug, Default)]
struct UserRooms {
    rooms: HashSet<String>,
    /// Set when the user's last session dropped
    disconnected_at: Option<Instant>,
}

/// Result of registering a session
#[derive(Debug)]
pub struct RegisterOutcome {
    /// Whether a previous session's state was restored
    pub recovered: bool,
    /// Rooms this session starts out joined to
    pub rooms: Vec<String>,
}

/// Result of unregistering a session
#[derive(Debug)]
pub struct DisconnectInfo {
    pub user_id: UserId,
    /// True when the user has no remaining sessions
    pub last_session: bool,
}

/// The hub tracking sessions, users and rooms
pub struct ConnectionHub {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    user_sessions: RwLock<HashMap<UserId, HashSet<String>>>,
    user_rooms: RwLock<HashMap<UserId, UserRooms>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    recovery_window: Duration,
    room_retention: Duration,
}

impl ConnectionHub {
    pub fn new(recovery_window: Duration, room_retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            user_sessions: RwLock::new(HashMap::new()),
            user_rooms: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            recovery_window,
            room_retention,
        }
    }

    /// Register an authenticated session
    ///
    /// When the handshake declared a reconnection and the recovery
    /// window is still active for this user, the per-user room union is
    /// rejoined onto the new session.
    pub async fn register(
        &self,
        session_id: &str,
        user_id: UserId,
        command_tx: mpsc::UnboundedSender<ConnectionCommand>,
        reconnected_from: Option<String>,
    ) -> RegisterOutcome {
        let reconnecting = reconnected_from.is_some();

        let (recovered, restore) = {
            let mut user_rooms = self.user_rooms.write().await;
            match user_rooms.get_mut(&user_id) {
                Some(entry) => {
                    let window_active = match entry.disconnected_at {
                        None => true,
                        Some(at) => at.elapsed() <= self.recovery_window,
                    };
                    entry.disconnected_at = None;

                    if reconnecting && window_active {
                        (true, entry.rooms.iter().cloned().collect::<Vec<_>>())
                    } else {
                        if !window_active {
                            entry.rooms.clear();
                        }
                        (false, Vec::new())
                    }
                }
                None => {
                    user_rooms.insert(user_id, UserRooms::default());
                    (false, Vec::new())
                }
            }
        };

        let entry = SessionEntry {
            session_id: session_id.to_string(),
            user_id,
            command_tx,
            rooms: restore.iter().cloned().collect(),
            connected_at: Instant::now(),
            reconnected_from,
        };

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.to_string(), entry);
        }
        {
            let mut user_sessions = self.user_sessions.write().await;
            user_sessions
                .entry(user_id)
                .or_insert_with(HashSet::new)
                .insert(session_id.to_string());
        }
        {
            let mut rooms = self.rooms.write().await;
            for room in &restore {
                rooms
                    .entry(room.clone())
                    .or_insert_with(HashSet::new)
                    .insert(session_id.to_string());
            }
        }

        debug!(session = session_id, user = user_id, recovered, "session registered");
        RegisterOutcome {
            recovered,
            rooms: restore,
        }
    }

    /// Remove a session; stamps the disconnect time when it was the last one
    pub async fn unregister(&self, session_id: &str) -> Option<DisconnectInfo> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)?
        };

        {
            let mut rooms = self.rooms.write().await;
            for room in &entry.rooms {
                if let Some(members) = rooms.get_mut(room) {
                    members.remove(session_id);
                    if members.is_empty() {
                        rooms.remove(room);
                    }
                }
            }
        }

        let last_session = {
            let mut user_sessions = self.user_sessions.write().await;
            match user_sessions.get_mut(&entry.user_id) {
                Some(set) => {
                    set.remove(session_id);
                    if set.is_empty() {
                        user_sessions.remove(&entry.user_id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };

        if last_session {
            let mut user_rooms = self.user_rooms.write().await;
            if let Some(rooms) = user_rooms.get_mut(&entry.user_id) {
                rooms.disconnected_at = Some(Instant::now());
            }
        }

        debug!(
            session = session_id,
            user = entry.user_id,
            last_session,
            "session unregistered"
        );
        Some(DisconnectInfo {
            user_id: entry.user_id,
            last_session,
        })
    }

    /// Join a session to a named room
    pub async fn join_room(&self, session_id: &str, room: &str) -> bool {
        let user_id = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.rooms.insert(room.to_string());
                    entry.user_id
                }
                None => return false,
            }
        };

        {
            let mut rooms = self.rooms.write().await;
            rooms
                .entry(room.to_string())
                .or_insert_with(HashSet::new)
                .insert(session_id.to_string());
        }
        {
            let mut user_rooms = self.user_rooms.write().await;
            user_rooms
                .entry(user_id)
                .or_insert_with(UserRooms::default)
                .rooms
                .insert(room.to_string());
        }
        true
    }

    /// Remove a session from a room; the user-level union drops the room
    /// once no session of that user remains in it
    pub async fn leave_room(&self, session_id: &str, room: &str) -> bool {
        let user_id = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    if !entry.rooms.remove(room) {
                        return false;
                    }
                    entry.user_id
                }
                None => return false,
            }
        };

        {
            let mut rooms = self.rooms.write().await;
            if let Some(members) = rooms.get_mut(room) {
                members.remove(session_id);
                if members.is_empty() {
                    rooms.remove(room);
                }
            }
        }

        let still_joined = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .any(|s| s.user_id == user_id && s.rooms.contains(room))
        };
        if !still_joined {
            let mut user_rooms = self.user_rooms.write().await;
            if let Some(entry) = user_rooms.get_mut(&user_id) {
                entry.rooms.remove(room);
            }
        }
        true
    }

    /// Deliver a command to one session
    pub async fn send_to_session(&self, session_id: &str, command: ConnectionCommand) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(entry) => entry.command_tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Deliver a frame to every session of a user; no-op without sessions
    pub async fn send_frame_to_user(&self, user_id: UserId, frame: Frame) -> usize {
        let session_ids = {
            let user_sessions = self.user_sessions.read().await;
            match user_sessions.get(&user_id) {
                Some(set) => set.iter().cloned().collect::<Vec<_>>(),
                None => return 0,
            }
        };

        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for session_id in session_ids {
            if let Some(entry) = sessions.get(&session_id) {
                if entry
                    .command_tx
                    .send(ConnectionCommand::Deliver(frame.clone()))
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Deliver a frame to every session in a room
    pub async fn broadcast_frame(
        &self,
        room: &str,
        frame: Frame,
        except_user: Option<UserId>,
    ) -> usize {
        let member_ids = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(members) => members.iter().cloned().collect::<Vec<_>>(),
                None => return 0,
            }
        };

        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for session_id in member_ids {
            if let Some(entry) = sessions.get(&session_id) {
                if Some(entry.user_id) == except_user {
                    continue;
                }
                if entry
                    .command_tx
                    .send(ConnectionCommand::Deliver(frame.clone()))
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Encode a typed event once and deliver it to every session of a user
    pub async fn send_to_user<T: Encodable>(&self, user_id: UserId, event: &T) -> usize {
        match event.encode_frame() {
            Ok(frame) => self.send_frame_to_user(user_id, frame).await,
            Err(e) => {
                warn!(user = user_id, error = %e, "failed to encode event");
                0
            }
        }
    }

    /// Encode a typed event once and deliver it to one session
    pub async fn send_to_session_event<T: Encodable>(&self, session_id: &str, event: &T) -> bool {
        match event.encode_frame() {
            Ok(frame) => {
                self.send_to_session(session_id, ConnectionCommand::Deliver(frame))
                    .await
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "failed to encode event");
                false
            }
        }
    }

    /// Encode a typed event once and broadcast it to a room
    pub async fn broadcast_to_room<T: Encodable>(
        &self,
        room: &str,
        event: &T,
        except_user: Option<UserId>,
    ) -> usize {
        match event.encode_frame() {
            Ok(frame) => self.broadcast_frame(room, frame, except_user).await,
            Err(e) => {
                warn!(room, error = %e, "failed to encode event");
                0
            }
        }
    }

    /// Ask a session's connection task to close
    pub async fn close_session(&self, session_id: &str, reason: &str) -> bool {
        self.send_to_session(session_id, ConnectionCommand::Close(reason.to_string()))
            .await
    }

    /// Whether the user currently holds any session
    pub async fn user_connected(&self, user_id: UserId) -> bool {
        let user_sessions = self.user_sessions.read().await;
        user_sessions
            .get(&user_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of distinct connected users
    pub async fn user_count(&self) -> usize {
        self.user_sessions.read().await.len()
    }

    /// All connected user ids
    pub async fn connected_users(&self) -> Vec<UserId> {
        self.user_sessions.read().await.keys().copied().collect()
    }

    /// The user-level room union
    pub async fn rooms_of_user(&self, user_id: UserId) -> Vec<String> {
        let user_rooms = self.user_rooms.read().await;
        user_rooms
            .get(&user_id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sessions currently joined to a room
    pub async fn room_size(&self, room: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Drop the room memory of a user whose disconnect outlived the
    /// retention period; returns true when state was forgotten
    pub async fn forget_rooms_if_expired(&self, user_id: UserId) -> bool {
        if self.user_connected(user_id).await {
            return false;
        }

        let mut user_rooms = self.user_rooms.write().await;
        let expired = user_rooms
            .get(&user_id)
            .and_then(|e| e.disconnected_at)
            .map(|at| at.elapsed() >= self.room_retention)
            .unwrap_or(false);

        if expired {
            user_rooms.remove(&user_id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::SearchExpired;

    fn hub() -> ConnectionHub {
        ConnectionHub::new(Duration::from_secs(120), Duration::from_secs(120))
    }

    fn channel() -> (
        mpsc::UnboundedSender<ConnectionCommand>,
        mpsc::UnboundedReceiver<ConnectionCommand>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_register_and_fanout_to_all_sessions() {
        let hub = hub();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.register("s2", 1, tx2, None).await;
        assert_eq!(hub.session_count().await, 2);
        assert_eq!(hub.user_count().await, 1);

        let delivered = hub.send_to_user(1, &SearchExpired {}).await;
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());

        // Unknown user: no-op
        assert_eq!(hub.send_to_user(9, &SearchExpired {}).await, 0);
    }

    #[tokio::test]
    async fn test_room_broadcast_excludes_user() {
        let hub = hub();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.register("s2", 2, tx2, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.join_room("s2", "chat:x").await;

        let delivered = hub
            .broadcast_to_room("chat:x", &SearchExpired {}, Some(1))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_room_union_semantics() {
        let hub = hub();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.register("s2", 1, tx2, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.join_room("s2", "chat:x").await;

        // One session leaves: the union still holds the room
        hub.leave_room("s1", "chat:x").await;
        assert_eq!(hub.rooms_of_user(1).await, vec!["chat:x".to_string()]);

        // Last session leaves: the union drops it
        hub.leave_room("s2", "chat:x").await;
        assert!(hub.rooms_of_user(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_restores_rooms_within_window() {
        let hub = hub();
        let (tx1, _rx1) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.join_room("s1", "search_stats_room").await;

        let info = hub.unregister("s1").await.unwrap();
        assert!(info.last_session);

        let (tx2, _rx2) = channel();
        let outcome = hub.register("s2", 1, tx2, Some("s1".to_string())).await;
        assert!(outcome.recovered);

        let mut rooms = outcome.rooms.clone();
        rooms.sort();
        assert_eq!(rooms, vec!["chat:x", "search_stats_room"]);

        // The restored session is a live member of its rooms again
        assert_eq!(hub.room_size("chat:x").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_outside_window_restores_nothing() {
        let hub = hub();
        let (tx1, _rx1) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.unregister("s1").await;

        tokio::time::advance(Duration::from_secs(121)).await;

        let (tx2, _rx2) = channel();
        let outcome = hub.register("s2", 1, tx2, Some("s1".to_string())).await;
        assert!(!outcome.recovered);
        assert!(outcome.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_connect_does_not_restore() {
        let hub = hub();
        let (tx1, _rx1) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.unregister("s1").await;

        // No reconnection declared: no restore, even inside the window
        let (tx2, _rx2) = channel();
        let outcome = hub.register("s2", 1, tx2, None).await;
        assert!(!outcome.recovered);
        assert!(outcome.rooms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_rooms_after_retention() {
        let hub = hub();
        let (tx1, _rx1) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.join_room("s1", "chat:x").await;
        hub.unregister("s1").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!hub.forget_rooms_if_expired(1).await);
        assert!(!hub.rooms_of_user(1).await.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(hub.forget_rooms_if_expired(1).await);
        assert!(hub.rooms_of_user(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_rooms_skipped_while_connected() {
        let hub = hub();
        let (tx1, _rx1) = channel();

        hub.register("s1", 1, tx1, None).await;
        hub.join_room("s1", "chat:x").await;

        assert!(!hub.forget_rooms_if_expired(1).await);
        assert_eq!(hub.rooms_of_user(1).await.len(), 1);
    }
}
