//! # WebSocket Session Transport
//!
//! One WebSocket connection is one voice session. The socket actor is the
//! transport adapter: it turns socket events into Session Manager calls and
//! pumps the session's paced outbound frames back to the client.
//!
//! ## WebSocket Protocol:
//! 1. **Offer**: `GET /ws/session?sample_rate=48000&channels=1` (both optional)
//! 2. **Answer**: server sends `{"type":"answer", ...}` with the session id and formats
//! 3. **Metadata**: client sends `{"type":"control","message":"NAME>... PERSONALITY>..."}`
//! 4. **Audio**: binary messages carry inbound s16le PCM in the offered format
//! 5. **Replies**: server sends binary s16le frames continuously (silence between
//!    replies) and `control` messages (`<TRANSCRIBERWARMEDUP>`, `FROMUSER>`, `FROMBOT>`)
//!
//! ## Message Format:
//! - **Client → Server**: binary PCM, JSON `control` / `ping` / `pong`
//! - **Server → Client**: binary PCM, JSON `answer` / `control` / `error` / `ping` / `pong`

use crate::audio::convert::AudioFormat;
use crate::error::{AppError, EngineError};
use crate::session::manager::SessionAnswer;
use crate::session::{ConnectionState, PeerConnection, SessionManager, SessionOffer};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// JSON messages exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketMessage {
    /// Negotiated session parameters, sent once after connecting
    Answer {
        session_id: String,
        inbound_format: AudioFormat,
        analysis_format: AudioFormat,
        output_format: AudioFormat,
        frame_duration_ms: u32,
    },

    /// Control-channel text, both directions
    Control { message: String },

    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    Ping { timestamp: i64 },

    Pong { timestamp: i64 },
}

impl From<SessionAnswer> for SocketMessage {
    fn from(answer: SessionAnswer) -> Self {
        SocketMessage::Answer {
            session_id: answer.session_id,
            inbound_format: answer.inbound_format,
            analysis_format: answer.analysis_format,
            output_format: answer.output_format,
            frame_duration_ms: answer.frame_duration_ms,
        }
    }
}

impl SocketMessage {
    fn to_json(&self) -> Option<String> {
        serde_json::to_string(self)
            .map_err(|err| error!("Failed to serialize socket message: {}", err))
            .ok()
    }
}

/// Text to send to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// One outbound PCM frame.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundFrame(Vec<u8>);

/// Close the socket from outside the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

/// The session's handle on its socket.
pub struct WsPeer {
    addr: Addr<SessionSocket>,
    state: Mutex<ConnectionState>,
}

impl WsPeer {
    fn new(addr: Addr<SessionSocket>) -> Self {
        Self {
            addr,
            state: Mutex::new(ConnectionState::Connecting),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl PeerConnection for WsPeer {
    fn connection_state(&self) -> ConnectionState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() && !self.addr.connected() {
            return ConnectionState::Closed;
        }
        state
    }

    fn send_control(&self, message: &str) -> crate::error::EngineResult<()> {
        let json = SocketMessage::Control {
            message: message.to_string(),
        }
        .to_json()
        .ok_or_else(|| EngineError::Transport("unserializable control message".to_string()))?;

        if !self.addr.connected() {
            return Err(EngineError::Transport("socket closed".to_string()));
        }
        self.addr.do_send(SendText(json));
        Ok(())
    }

    fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.addr.do_send(CloseSocket);
    }
}

/// WebSocket actor for one voice session.
pub struct SessionSocket {
    manager: SessionManager,
    offer: SessionOffer,
    session_id: Option<String>,
    peer: Option<Arc<WsPeer>>,
    pump: Option<tokio::task::JoinHandle<()>>,
    last_heartbeat: Instant,
    heartbeat_timeout: Duration,
}

impl SessionSocket {
    pub fn new(manager: SessionManager, offer: SessionOffer, heartbeat_timeout: Duration) -> Self {
        Self {
            manager,
            offer,
            session_id: None,
            peer: None,
            pump: None,
            last_heartbeat: Instant::now(),
            heartbeat_timeout,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &SocketMessage) {
        if let Some(json) = message.to_json() {
            ctx.text(json);
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, err: &EngineError) {
        warn!(session_id = ?self.session_id, code = err.code(), "WebSocket error: {}", err);
        self.send(
            ctx,
            &SocketMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                session_id: self.session_id.clone(),
            },
        );
    }

    /// Forward paced frames from the playback scheduler to the socket.
    fn start_playback_pump(&mut self, session_id: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(playback) = self.manager.playback(session_id) else {
            return;
        };
        let addr = ctx.address();
        let session_id = session_id.to_string();

        self.pump = Some(tokio::spawn(async move {
            let mut frames = 0u64;
            while let Some(frame) = playback.next_frame().await {
                if !addr.connected() {
                    break;
                }
                addr.do_send(OutboundFrame(frame.data));
                frames += 1;
            }
            debug!(session_id = %session_id, frames, "playback pump finished");
        }));
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = (self.heartbeat_timeout / 2).max(Duration::from_secs(1));
        ctx.run_interval(interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.heartbeat_timeout {
                warn!(session_id = ?act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let ping = SocketMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            act.send(ctx, &ping);
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session_id) = self.session_id.clone() else {
            return;
        };

        match serde_json::from_str::<SocketMessage>(text) {
            Ok(SocketMessage::Control { message }) => {
                match self.manager.on_control_message(&session_id, &message) {
                    Ok(outcome) => debug!(session_id = %session_id, ?outcome, "control message applied"),
                    Err(err) => self.send_error(ctx, &err),
                }
            }
            Ok(SocketMessage::Ping { timestamp }) => {
                self.send(ctx, &SocketMessage::Pong { timestamp });
            }
            Ok(SocketMessage::Pong { .. }) => {}
            Ok(_) => {
                warn!(session_id = %session_id, "Received unexpected message type from client");
            }
            Err(err) => {
                let err = EngineError::Protocol(format!("invalid JSON: {}", err));
                self.send_error(ctx, &err);
            }
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Negotiate the session as soon as the socket is up.
    fn started(&mut self, ctx: &mut Self::Context) {
        let peer = Arc::new(WsPeer::new(ctx.address()));

        let answer = match self.manager.on_offer(self.offer, peer.clone()) {
            Ok(answer) => answer,
            Err(err) => {
                self.send_error(ctx, &err);
                ctx.close(Some(ws::CloseCode::Again.into()));
                ctx.stop();
                return;
            }
        };

        let session_id = answer.session_id.clone();
        info!(session_id = %session_id, "WebSocket session connected");
        self.send(ctx, &SocketMessage::from(answer));

        self.session_id = Some(session_id.clone());
        self.peer = Some(peer.clone());

        peer.set_state(ConnectionState::Connected);
        if let Err(err) = self
            .manager
            .on_connection_state_change(&session_id, ConnectionState::Connected)
        {
            self.send_error(ctx, &err);
        }

        self.start_playback_pump(&session_id, ctx);
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(peer) = &self.peer {
            peer.set_state(ConnectionState::Closed);
        }
        if let Some(session_id) = &self.session_id {
            self.manager.on_close(session_id);
            info!(session_id = %session_id, "WebSocket session stopped");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                let Some(session_id) = &self.session_id else {
                    return;
                };
                if let Err(err) = self.manager.on_inbound_frame(session_id, &data, None) {
                    self.send_error(ctx, &err);
                }
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = ?self.session_id, "WebSocket closed: {:?}", reason);
                if let Some(peer) = &self.peer {
                    peer.set_state(ConnectionState::Closed);
                }
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = ?self.session_id, "WebSocket protocol error: {}", err);
                if let Some(peer) = &self.peer {
                    peer.set_state(ConnectionState::Failed);
                }
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<OutboundFrame> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0);
    }
}

impl Handler<CloseSocket> for SessionSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses the upgrade with 409 when the server is already at its session
/// limit; otherwise the `SessionSocket` actor takes over the connection.
pub async fn session_socket(
    req: HttpRequest,
    stream: web::Payload,
    offer: web::Query<SessionOffer>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let config = app_state.get_config();
    let max = config.sessions.max_concurrent_sessions;
    if app_state.sessions.active_count() >= max {
        return Err(AppError::from(EngineError::SessionLimit(max)).into());
    }

    let socket = SessionSocket::new(
        app_state.sessions.clone(),
        offer.into_inner(),
        Duration::from_secs(config.sessions.heartbeat_timeout_secs),
    );
    ws::start(socket, &req, stream)
}
