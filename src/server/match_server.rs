//! The matchmaker server: endpoint, accept loop and event dispatch
//!
//! Accepts QUIC connections, spawns a handler task per connection and
//! routes the handler's [`ServerEvent`]s to the matcher, chat router
//! and stats broadcaster. Disconnects drive the cancellation grace
//! timer and the room-retention timer.

use std::collections::HashMap;
use std::sync::Arc;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{TokenVerifier, UserDirectory};
use crate::error::{Result, TandemError};
use crate::protocol::messages::{
    AuthOk, ConnectionRecovered, ContactRequested, ContactResponseStatus, ContactStatus,
    ErrorEvent, SearchCriteria, SearchStatus, UserId,
};
use crate::server::chat_router::ChatRouter;
use crate::server::connection::{
    ConnectionCommand, ConnectionConfig, ConnectionHandler, ServerEvent,
};
use crate::server::hub::ConnectionHub;
use crate::server::matcher::Matcher;
use crate::server::stats::StatsBroadcaster;
use crate::store::Store;

/// How often connected users' lastActive stamps are refreshed
const ACTIVITY_REFRESH_SECS: u64 = 10;

/// The matchmaker server
pub struct MatchServer {
    config: Arc<Config>,
    store: Arc<Store>,
    directory: Arc<dyn UserDirectory>,
    verifier: Arc<dyn TokenVerifier>,
    hub: Arc<ConnectionHub>,
    matcher: Arc<Matcher>,
    chat_router: Arc<ChatRouter>,
    stats: Arc<StatsBroadcaster>,
    /// Command channels of all connections, including pre-auth ones
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<ConnectionCommand>>>,
}

impl MatchServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        directory: Arc<dyn UserDirectory>,
        verifier: Arc<dyn TokenVerifier>,
        hub: Arc<ConnectionHub>,
        matcher: Arc<Matcher>,
        chat_router: Arc<ChatRouter>,
        stats: Arc<StatsBroadcaster>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            verifier,
            hub,
            matcher,
            chat_router,
            stats,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live connections (pre-auth included)
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Start the server and accept connections until the endpoint closes
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let endpoint = self.build_endpoint()?;
        info!("Matchmaker listening on {}", endpoint.local_addr()?);
        self.accept_connections(endpoint).await
    }

    /// Assemble TLS, transport limits and the QUIC endpoint
    ///
    /// The certificate is self-signed per process start; production
    /// deployments terminate TLS in front with real certificates.
    fn build_endpoint(&self) -> Result<Endpoint> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| TandemError::config(format!("certificate generation failed: {}", e)))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|e| TandemError::config(format!("certificate encoding failed: {}", e)))?;
        let key_der = cert.serialize_private_key_der();

        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert_der)],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            )
            .map_err(|e| TandemError::config(format!("TLS setup failed: {}", e)))?;
        tls.alpn_protocols = vec![b"tandem".to_vec()];
        tls.max_early_data_size = 0;

        let idle = quinn::IdleTimeout::try_from(self.config.idle_timeout)
            .map_err(|e| TandemError::config(format!("idle timeout out of range: {}", e)))?;
        let mut transport = quinn::TransportConfig::default();
        transport
            .max_concurrent_bidi_streams(16u32.into())
            .max_concurrent_uni_streams(16u32.into())
            .max_idle_timeout(Some(idle))
            .datagram_receive_buffer_size(Some(64 * 1024));

        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| TandemError::config(format!("QUIC crypto setup failed: {}", e)))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));

        Endpoint::server(server_config, self.config.bind_addr).map_err(|e| {
            TandemError::network(format!("could not bind {}: {}", self.config.bind_addr, e))
        })
    }

    /// Accept incoming connections
    async fn accept_connections(self: Arc<Self>, endpoint: Endpoint) -> Result<()> {
        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    {
                        let connections = self.connections.read().await;
                        if connections.len() >= self.config.max_connections {
                            warn!("Connection limit reached, rejecting connection");
                            incoming.refuse();
                            continue;
                        }
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_incoming(incoming).await {
                            debug!("Connection handling failed: {}", e);
                        }
                    });
                }
                None => {
                    warn!("Endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle one incoming connection for its whole lifetime
    async fn handle_incoming(self: &Arc<Self>, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await?;
        let session_id = uuid::Uuid::new_v4().to_string();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(session_id.clone(), command_tx);
        }

        let handler = Arc::new(ConnectionHandler::new(
            connection,
            Arc::clone(&self.verifier),
            session_id.clone(),
            ConnectionConfig {
                heartbeat_interval: self.config.heartbeat_interval,
                heartbeat_timeout: self.config.heartbeat_timeout,
            },
            event_tx,
            command_rx,
        ));

        let handler_task = tokio::spawn(handler.run());

        let event_task = {
            let server = Arc::clone(self);
            let session_id = session_id.clone();
            tokio::spawn(async move {
                server.process_events(session_id, event_rx).await;
            })
        };

        tokio::select! {
            result = handler_task => {
                if let Ok(Err(e)) = result {
                    debug!(session = %session_id, "handler finished: {}", e);
                }
            }
            _ = event_task => {}
        }

        self.cleanup_connection(&session_id).await;
        Ok(())
    }

    /// Process events from a connection
    async fn process_events(
        self: &Arc<Self>,
        session_id: String,
        mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = self.handle_event(&session_id, event).await {
                warn!(session = %session_id, error = %e, "event handling error");
            }
        }
    }

    /// Handle a single event from a connection
    async fn handle_event(&self, session_id: &str, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Authenticated {
                user_id,
                previous_session,
            } => {
                self.handle_authenticated(session_id, user_id, previous_session)
                    .await?;
            }

            ServerEvent::SearchStart { user_id, criteria } => {
                self.handle_search_start(session_id, user_id, criteria).await;
            }

            ServerEvent::SearchCancel { user_id } => {
                match self.matcher.cancel_search(user_id).await {
                    Ok(outcome) => {
                        self.hub
                            .send_to_session_event(
                                session_id,
                                &SearchStatus {
                                    status: outcome.status,
                                },
                            )
                            .await;
                    }
                    Err(e) => self.report_error(session_id, &e).await,
                }
            }

            ServerEvent::SubscribeStats { user_id } => {
                if let Err(e) = self.stats.subscribe(session_id, user_id).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::UnsubscribeStats { .. } => {
                self.stats.unsubscribe(session_id).await;
            }

            ServerEvent::ChatJoin { user_id, chat_id } => {
                if let Err(e) = self.chat_router.join(session_id, user_id, &chat_id).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ChatLeave { chat_id, .. } => {
                self.chat_router.leave(session_id, &chat_id).await;
            }

            ServerEvent::ChatMessage {
                user_id,
                chat_id,
                content,
            } => {
                if let Err(e) = self.chat_router.message(user_id, &chat_id, &content).await {
                    // Breaker fallback: tell the sender the message is queued
                    if matches!(e, TandemError::StoreUnavailable(_)) {
                        self.hub
                            .send_to_session_event(
                                session_id,
                                &ErrorEvent::new(e.code(), "Message queued"),
                            )
                            .await;
                    } else {
                        self.report_error(session_id, &e).await;
                    }
                }
            }

            ServerEvent::ChatTyping { user_id, chat_id } => {
                if let Err(e) = self.chat_router.typing(user_id, &chat_id).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ChatRead {
                user_id,
                chat_id,
                timestamp,
            } => {
                if let Err(e) = self.chat_router.read(user_id, &chat_id, timestamp).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ChatEnd {
                user_id,
                chat_id,
                reason,
            } => {
                if let Err(e) = self.chat_router.end(user_id, &chat_id, reason).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ChatRate {
                user_id,
                chat_id,
                score,
                comment,
            } => {
                if let Err(e) = self
                    .chat_router
                    .rate(user_id, &chat_id, score, comment)
                    .await
                {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ContactRequest {
                user_id,
                to,
                chat_id,
            } => {
                if let Err(e) = self.handle_contact_request(user_id, to, &chat_id).await {
                    self.report_error(session_id, &e).await;
                }
            }

            ServerEvent::ContactRespond {
                user_id,
                requester,
                status,
            } => {
                self.handle_contact_respond(user_id, requester, status).await;
            }

            ServerEvent::Disconnected { user_id, reason } => {
                debug!(
                    session = session_id,
                    user = ?user_id,
                    reason,
                    "connection disconnected"
                );
            }
        }

        Ok(())
    }

    /// Register the authenticated session and restore rooms on reconnect
    async fn handle_authenticated(
        &self,
        session_id: &str,
        user_id: UserId,
        previous_session: Option<String>,
    ) -> Result<()> {
        let command_tx = {
            let connections = self.connections.read().await;
            connections
                .get(session_id)
                .cloned()
                .ok_or_else(|| TandemError::connection("session vanished before registration"))?
        };

        let outcome = self
            .hub
            .register(session_id, user_id, command_tx, previous_session)
            .await;

        self.directory.set_active(user_id, true).await?;

        self.hub
            .send_to_session_event(
                session_id,
                &AuthOk {
                    user_id,
                    session_id: session_id.to_string(),
                    recovered: outcome.recovered,
                    rooms: outcome.rooms.clone(),
                },
            )
            .await;

        if outcome.recovered {
            info!(user = user_id, session = session_id, "session recovered");
            self.hub
                .send_to_session_event(
                    session_id,
                    &ConnectionRecovered {
                        rooms: outcome.rooms,
                    },
                )
                .await;
        }

        Ok(())
    }

    /// Run a search and reply with its status
    async fn handle_search_start(
        &self,
        session_id: &str,
        user_id: UserId,
        criteria: SearchCriteria,
    ) {
        match self.matcher.start_search(user_id, criteria).await {
            Ok(outcome) => {
                self.hub
                    .send_to_session_event(
                        session_id,
                        &SearchStatus {
                            status: outcome.status,
                        },
                    )
                    .await;
            }
            Err(e) => {
                // Breaker fallback: refuse politely while the store is down
                if matches!(e, TandemError::StoreUnavailable(_)) {
                    self.hub
                        .send_to_session_event(
                            session_id,
                            &ErrorEvent::new(e.code(), "search service temporarily unavailable"),
                        )
                        .await;
                } else {
                    self.report_error(session_id, &e).await;
                }
            }
        }
    }

    /// Forward a contact-exchange request to the chat partner
    async fn handle_contact_request(
        &self,
        user_id: UserId,
        to: UserId,
        chat_id: &str,
    ) -> Result<()> {
        let chat = self
            .store
            .chat(chat_id)
            .await?
            .ok_or_else(|| TandemError::not_found("chat"))?;

        if !chat.is_participant(user_id) {
            return Err(TandemError::precondition("not a chat participant"));
        }
        if chat.other_participant(user_id) != Some(to) {
            return Err(TandemError::precondition("target is not the chat partner"));
        }

        // Offline targets are a silent no-op
        self.hub
            .send_to_user(
                to,
                &ContactRequested {
                    from: user_id,
                    chat_id: chat_id.to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// Forward a contact-exchange answer back to the requester
    async fn handle_contact_respond(
        &self,
        responder: UserId,
        requester: UserId,
        status: ContactResponseStatus,
    ) {
        self.hub
            .send_to_user(
                requester,
                &ContactStatus {
                    user_id: responder,
                    status,
                },
            )
            .await;
    }

    /// Send an error event to the offending session only
    async fn report_error(&self, session_id: &str, error: &TandemError) {
        self.hub
            .send_to_session_event(session_id, &ErrorEvent::from_error(error))
            .await;
    }

    /// Tear down a closed connection and start the disconnect timers
    async fn cleanup_connection(self: &Arc<Self>, session_id: &str) {
        {
            let mut connections = self.connections.write().await;
            connections.remove(session_id);
        }

        let info = match self.hub.unregister(session_id).await {
            Some(info) => info,
            None => return, // never authenticated
        };

        if !info.last_session {
            return;
        }

        let user_id = info.user_id;
        if let Err(e) = self.directory.set_active(user_id, false).await {
            warn!(user = user_id, error = %e, "failed to clear active flag");
        }

        // Cancellation grace: a quick reconnect keeps the search alive
        {
            let server = Arc::clone(self);
            let grace = self.config.disconnect_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if server.hub.user_connected(user_id).await {
                    return;
                }
                match server.matcher.cancel_search(user_id).await {
                    Ok(_) => debug!(user = user_id, "search cancelled after disconnect grace"),
                    Err(e) => warn!(user = user_id, error = %e, "grace cancellation failed"),
                }
            });
        }

        // Room retention: forget the per-user room set after the window
        {
            let server = Arc::clone(self);
            let retention = self.config.room_retention;
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                if server.hub.forget_rooms_if_expired(user_id).await {
                    debug!(user = user_id, "room memory forgotten");
                }
            });
        }
    }

    /// Periodically refresh lastActive for connected users and
    /// rebroadcast stats
    pub fn spawn_activity_refresher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(ACTIVITY_REFRESH_SECS));
            loop {
                interval.tick().await;
                let users = server.hub.connected_users().await;
                if users.is_empty() {
                    continue;
                }
                for user_id in users {
                    if let Err(e) = server.directory.touch_last_active(user_id).await {
                        warn!(user = user_id, error = %e, "lastActive refresh failed");
                        break;
                    }
                }
                server.stats.schedule_broadcast().await;
            }
        })
    }
}
