//! Per-connection protocol handling
//!
//! Each client connection runs one handler task owning the handshake
//! (Hello -> Auth -> Ready), the control-stream frame loop, the
//! outbound command pump and the heartbeat. Decoded client commands are
//! forwarded to the server as [`ServerEvent`]s; the server answers
//! through the command channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::directory::TokenVerifier;
use crate::error::{Result, TandemError};
use crate::protocol::codec::{ClientCommand, Encodable};
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::messages::{
    AuthFailed, ChatId, ContactResponseStatus, ErrorEvent, HelloAck, Ping, Pong, SearchCriteria,
    UserId,
};

/// Events emitted by a connection handler to the server
#[derive(Debug)]
pub enum ServerEvent {
    /// Token verified; the server should register the session
    Authenticated {
        user_id: UserId,
        previous_session: Option<String>,
    },

    SearchStart {
        user_id: UserId,
        criteria: SearchCriteria,
    },
    SearchCancel {
        user_id: UserId,
    },
    SubscribeStats {
        user_id: UserId,
    },
    UnsubscribeStats {
        user_id: UserId,
    },

    ChatJoin {
        user_id: UserId,
        chat_id: ChatId,
    },
    ChatLeave {
        user_id: UserId,
        chat_id: ChatId,
    },
    ChatMessage {
        user_id: UserId,
        chat_id: ChatId,
        content: String,
    },
    ChatTyping {
        user_id: UserId,
        chat_id: ChatId,
    },
    ChatRead {
        user_id: UserId,
        chat_id: ChatId,
        timestamp: u64,
    },
    ChatEnd {
        user_id: UserId,
        chat_id: ChatId,
        reason: Option<String>,
    },
    ChatRate {
        user_id: UserId,
        chat_id: ChatId,
        score: u8,
        comment: Option<String>,
    },

    ContactRequest {
        user_id: UserId,
        to: UserId,
        chat_id: ChatId,
    },
    ContactRespond {
        user_id: UserId,
        requester: UserId,
        status: ContactResponseStatus,
    },

    /// The connection closed
    Disconnected {
        user_id: Option<UserId>,
        reason: String,
    },
}

/// Commands the server sends to a connection handler
#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    /// Write a pre-encoded frame to the control stream
    Deliver(Frame),
    /// Close the connection
    Close(String),
}

/// Heartbeat tuning for a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(20),
        }
    }
}

/// State of the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for Hello from client
    AwaitingHello,
    /// Hello received, sent HelloAck, waiting for Auth
    AwaitingAuth,
    /// Fully authenticated
    Ready,
}

/// Per-connection handler that manages the control stream and protocol
pub struct ConnectionHandler {
    /// Underlying QUIC connection
    connection: Connection,

    /// Token verification seam
    verifier: Arc<dyn TokenVerifier>,

    /// Session ID assigned at accept time
    session_id: String,

    /// Heartbeat configuration
    config: ConnectionConfig,

    /// User ID (set after authentication)
    user_id: RwLock<Option<UserId>>,

    /// Previous session declared in the Hello (reconnection)
    previous_session: RwLock<Option<String>>,

    /// Handshake state
    handshake_state: RwLock<HandshakeState>,

    /// Channel for sending events to the server
    event_tx: mpsc::UnboundedSender<ServerEvent>,

    /// Channel for receiving commands from the server
    command_rx: RwLock<Option<mpsc::UnboundedReceiver<ConnectionCommand>>>,

    /// Control stream sender
    control_send: RwLock<Option<SendStream>>,

    /// Last heartbeat response (or any inbound traffic)
    last_activity: RwLock<Instant>,
}

impl ConnectionHandler {
    pub fn new(
        connection: Connection,
        verifier: Arc<dyn TokenVerifier>,
        session_id: String,
        config: ConnectionConfig,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) -> Self {
        Self {
            connection,
            verifier,
            session_id,
            config,
            user_id: RwLock::new(None),
            previous_session: RwLock::new(None),
            handshake_state: RwLock::new(HandshakeState::AwaitingHello),
            event_tx,
            command_rx: RwLock::new(Some(command_rx)),
            control_send: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Get the remote address
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Get user ID if authenticated
    pub async fn user_id(&self) -> Option<UserId> {
        *self.user_id.read().await
    }

    /// Check if authenticated
    pub async fn is_ready(&self) -> bool {
        *self.handshake_state.read().await == HandshakeState::Ready
    }

    /// Update last activity
    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Run the connection handler
    /// This is the main entry point that should be spawned as a task
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.remote_address();
        debug!(session = %self.session_id, %addr, "new connection");

        let result = self.accept_and_run().await;

        let user_id = self.user_id().await;
        let reason = match &result {
            Ok(()) => "normal".to_string(),
            Err(e) => e.to_string(),
        };

        let _ = self
            .event_tx
            .send(ServerEvent::Disconnected { user_id, reason });

        debug!(session = %self.session_id, %addr, "connection closed");
        result
    }

    /// Accept the control stream and run the task set
    async fn accept_and_run(self: &Arc<Self>) -> Result<()> {
        // The client opens the control bidirectional stream first
        let (send, recv) = self
            .connection
            .accept_bi()
            .await
            .map_err(|e| TandemError::connection(format!("Failed to accept control stream: {}", e)))?;

        {
            let mut control = self.control_send.write().await;
            *control = Some(send);
        }

        // Control stream receiver
        let recv_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = h.handle_control_stream(recv).await {
                    debug!("Control stream ended: {}", e);
                }
            })
        };

        // Command pump
        let cmd_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.handle_commands().await;
            })
        };

        // Datagram receiver (typing pulses)
        let dgram_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.handle_datagrams().await;
            })
        };

        // Heartbeat
        let ping_handle = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.heartbeat_loop().await;
            })
        };

        // Wait for any task to complete (usually means disconnect)
        tokio::select! {
            _ = recv_handle => {},
            _ = cmd_handle => {},
            _ = dgram_handle => {},
            _ = ping_handle => {},
        }

        Ok(())
    }

    /// Handle incoming frames on the control stream
    async fn handle_control_stream(self: &Arc<Self>, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    self.touch().await;
                    codec.push(&buf[..n]);

                    // Process all available frames
                    loop {
                        match codec.next_frame() {
                            Ok(Some(frame)) => {
                                if let Err(e) = self.handle_control_frame(frame).await {
                                    if matches!(e, TandemError::Auth(_)) {
                                        return Err(e);
                                    }
                                    warn!(session = %self.session_id, error = %e, "command failed");
                                    self.send_error(&e).await?;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                return Err(TandemError::protocol(format!(
                                    "Frame decode error: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Control stream finished");
                    break;
                }
                Err(e) => {
                    return Err(TandemError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handle a single control frame
    async fn handle_control_frame(&self, frame: Frame) -> Result<()> {
        let state = *self.handshake_state.read().await;
        let command = ClientCommand::decode(&frame)
            .map_err(|e| TandemError::protocol(format!("Invalid frame: {}", e)))?;

        match (state, command) {
            // Handshake: Hello
            (HandshakeState::AwaitingHello, ClientCommand::Hello(hello)) => {
                debug!(version = hello.version, "received Hello");
                *self.previous_session.write().await = hello.previous_session;

                let hello_ack = HelloAck {
                    version: 1,
                    session_id: self.session_id.clone(),
                };
                self.send_control_frame(&hello_ack).await?;
                *self.handshake_state.write().await = HandshakeState::AwaitingAuth;
            }

            // Handshake: Auth
            (HandshakeState::AwaitingAuth, ClientCommand::Auth(auth)) => {
                let token = match auth.bearer_token() {
                    Some(token) => token,
                    None => {
                        return self.refuse_auth("missing token").await;
                    }
                };

                let user_id = match self.verifier.verify(&token).await {
                    Ok(user_id) => user_id,
                    Err(e) => {
                        return self.refuse_auth(e.message()).await;
                    }
                };

                *self.user_id.write().await = Some(user_id);
                *self.handshake_state.write().await = HandshakeState::Ready;

                let previous_session = self.previous_session.read().await.clone();
                let _ = self.event_tx.send(ServerEvent::Authenticated {
                    user_id,
                    previous_session,
                });

                info!(
                    user = user_id,
                    session = %self.session_id,
                    "user authenticated"
                );
            }

            // Heartbeat
            (HandshakeState::Ready, ClientCommand::Ping(ping)) => {
                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                self.send_control_frame(&pong).await?;
            }

            (HandshakeState::Ready, ClientCommand::Pong(_)) => {
                self.touch().await;
            }

            (HandshakeState::Ready, ClientCommand::ConnectionAck(_)) => {
                debug!(session = %self.session_id, "handshake acknowledged");
            }

            // Goodbye is honored in any state
            (_, ClientCommand::Goodbye(goodbye)) => {
                debug!(reason = %goodbye.reason, "client sent Goodbye");
                self.connection.close(0u32.into(), goodbye.reason.as_bytes());
            }

            // Application commands require a completed handshake
            (HandshakeState::Ready, command) => {
                let user_id = self
                    .user_id()
                    .await
                    .ok_or_else(|| TandemError::auth("not authenticated"))?;
                if let Some(event) = command_event(user_id, command) {
                    let _ = self.event_tx.send(event);
                }
            }

            (state, command) => {
                return Err(TandemError::protocol(format!(
                    "Unexpected frame {:?} in state {:?}",
                    command.frame_type(),
                    state
                )));
            }
        }

        Ok(())
    }

    /// Reject the handshake and close the connection
    async fn refuse_auth(&self, message: &str) -> Result<()> {
        warn!(session = %self.session_id, message, "authentication refused");
        let failed = AuthFailed {
            code: TandemError::auth("").code(),
            message: message.to_string(),
        };
        let _ = self.send_control_frame(&failed).await;
        self.connection.close(1u32.into(), b"auth_error");
        Err(TandemError::auth(message))
    }

    /// Handle incoming datagrams (typing pulses)
    async fn handle_datagrams(self: &Arc<Self>) {
        loop {
            match self.connection.read_datagram().await {
                Ok(data) => {
                    self.touch().await;
                    if let Err(e) = self.handle_datagram(data).await {
                        debug!("Datagram ignored: {}", e);
                    }
                }
                Err(e) => {
                    debug!("Datagram receive ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Handle a single datagram
    async fn handle_datagram(&self, data: Bytes) -> Result<()> {
        if !self.is_ready().await {
            return Ok(()); // Silently ignore datagrams before auth
        }

        let frame = Frame::parse(&data)
            .map_err(|e| TandemError::protocol(format!("Invalid datagram frame: {}", e)))?;
        if !frame.kind.is_datagram() {
            return Err(TandemError::protocol(format!(
                "Frame {:?} is not valid as a datagram",
                frame.kind
            )));
        }

        let user_id = self
            .user_id()
            .await
            .ok_or_else(|| TandemError::auth("not authenticated"))?;
        let command = ClientCommand::decode(&frame)
            .map_err(|e| TandemError::protocol(format!("Invalid datagram: {}", e)))?;

        if let Some(event) = command_event(user_id, command) {
            let _ = self.event_tx.send(event);
        }
        Ok(())
    }

    /// Handle commands from the server
    async fn handle_commands(self: &Arc<Self>) {
        let rx = self.command_rx.write().await.take();
        let mut rx = match rx {
            Some(rx) => rx,
            None => return,
        };

        while let Some(cmd) = rx.recv().await {
            match cmd {
                ConnectionCommand::Deliver(frame) => {
                    if let Err(e) = self.write_frame(&frame).await {
                        warn!(session = %self.session_id, error = %e, "delivery failed");
                        break;
                    }
                }
                ConnectionCommand::Close(reason) => {
                    self.connection.close(0u32.into(), reason.as_bytes());
                    break;
                }
            }
        }
    }

    /// Heartbeat loop: ping on the interval, close when the client stays
    /// silent past interval + timeout
    async fn heartbeat_loop(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        let deadline = self.config.heartbeat_interval + self.config.heartbeat_timeout;

        loop {
            interval.tick().await;

            if !self.is_ready().await {
                continue;
            }

            if self.last_activity.read().await.elapsed() > deadline {
                warn!(session = %self.session_id, "heartbeat timeout, closing");
                self.connection.close(2u32.into(), b"heartbeat_timeout");
                break;
            }

            let ping = Ping {
                timestamp: current_timestamp(),
            };
            if self.send_control_frame(&ping).await.is_err() {
                break;
            }
        }
    }

    /// Write a frame to the control stream
    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut control = self.control_send.write().await;
        match control.as_mut() {
            Some(send) => {
                let data = frame.to_bytes();
                send.write_all(&data).await.map_err(|e| {
                    TandemError::network(format!("Failed to write to control stream: {}", e))
                })
            }
            None => Err(TandemError::connection("Control stream not open")),
        }
    }

    /// Send a typed message on the control stream
    async fn send_control_frame<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| TandemError::serialization(format!("Failed to encode frame: {}", e)))?;
        self.write_frame(&frame).await
    }

    /// Send an error event to the caller
    async fn send_error(&self, error: &TandemError) -> Result<()> {
        self.send_control_frame(&ErrorEvent::from_error(error)).await
    }
}

/// Map an application command to the server event carrying it
fn command_event(user_id: UserId, command: ClientCommand) -> Option<ServerEvent> {
    match command {
        ClientCommand::SearchStart(msg) => Some(ServerEvent::SearchStart {
            user_id,
            criteria: msg.criteria,
        }),
        ClientCommand::SearchCancel(_) => Some(ServerEvent::SearchCancel { user_id }),
        ClientCommand::SubscribeStats(_) => Some(ServerEvent::SubscribeStats { user_id }),
        ClientCommand::UnsubscribeStats(_) => Some(ServerEvent::UnsubscribeStats { user_id }),

        ClientCommand::ChatJoin(msg) => Some(ServerEvent::ChatJoin {
            user_id,
            chat_id: msg.chat_id,
        }),
        ClientCommand::ChatLeave(msg) => Some(ServerEvent::ChatLeave {
            user_id,
            chat_id: msg.chat_id,
        }),
        ClientCommand::ChatMessage(msg) => Some(ServerEvent::ChatMessage {
            user_id,
            chat_id: msg.chat_id,
            content: msg.content,
        }),
        ClientCommand::ChatTyping(msg) => Some(ServerEvent::ChatTyping {
            user_id,
            chat_id: msg.chat_id,
        }),
        ClientCommand::ChatRead(msg) => Some(ServerEvent::ChatRead {
            user_id,
            chat_id: msg.chat_id,
            timestamp: msg.timestamp,
        }),
        ClientCommand::ChatEnd(msg) => Some(ServerEvent::ChatEnd {
            user_id,
            chat_id: msg.chat_id,
            reason: msg.reason,
        }),
        ClientCommand::ChatRate(msg) => Some(ServerEvent::ChatRate {
            user_id,
            chat_id: msg.chat_id,
            score: msg.score,
            comment: msg.comment,
        }),

        ClientCommand::ContactRequest(msg) => Some(ServerEvent::ContactRequest {
            user_id,
            to: msg.to,
            chat_id: msg.chat_id,
        }),
        ClientCommand::ContactRespond(msg) => Some(ServerEvent::ContactRespond {
            user_id,
            requester: msg.user_id,
            status: msg.status,
        }),

        // Control frames are handled before reaching here
        ClientCommand::Hello(_)
        | ClientCommand::Auth(_)
        | ClientCommand::Ping(_)
        | ClientCommand::Pong(_)
        | ClientCommand::Goodbye(_)
        | ClientCommand::ConnectionAck(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ChatMessage, SearchCancel};

    #[test]
    fn test_command_event_mapping() {
        let event = command_event(
            7,
            ClientCommand::ChatMessage(ChatMessage {
                chat_id: "c1".to_string(),
                content: "hi".to_string(),
            }),
        );
        match event {
            Some(ServerEvent::ChatMessage {
                user_id,
                chat_id,
                content,
            }) => {
                assert_eq!(user_id, 7);
                assert_eq!(chat_id, "c1");
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let event = command_event(7, ClientCommand::SearchCancel(SearchCancel {}));
        assert!(matches!(
            event,
            Some(ServerEvent::SearchCancel { user_id: 7 })
        ));
    }

    #[test]
    fn test_control_commands_map_to_nothing() {
        assert!(command_event(1, ClientCommand::Ping(Ping { timestamp: 0 })).is_none());
        assert!(
            command_event(1, ClientCommand::ConnectionAck(Default::default())).is_none()
        );
    }
}
