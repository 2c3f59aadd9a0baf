//! # Relay Session Actor
//!
//! One actor per client WebSocket connection. The actor owns the connection's
//! [`UpstreamBridge`] and wires three event sources into it:
//!
//! - Client WebSocket frames (binary audio, text commands, control frames)
//! - Upstream recognition events, attached as an actor stream per opened
//!   recognition stream
//! - The deferred first frame of each stream, delivered when the stream's
//!   readiness signal fires or the grace period runs out
//!
//! ## Heartbeat:
//! The actor pings the client every 5 seconds and disconnects after 60
//! seconds without any sign of life, so dead connections don't pin
//! recognition streams open.

use crate::config::AppConfig;
use crate::engine::{RecognitionEngine, StreamConfig, UpstreamEvent};
use crate::relay::bridge::{EventOutcome, FrameOutcome, UpstreamBridge};
use crate::relay::messages::{ClientCommand, ServerMessage};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt as _};
use tracing::{debug, info, warn};

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long the client may stay silent before being disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// One upstream event, tagged with the generation of the stream it came from.
struct UpstreamDelivery {
    generation: u64,
    event: UpstreamEvent,
}

/// WebSocket actor for one relay session.
pub struct RelaySession {
    session_id: String,
    bridge: UpstreamBridge,
    app_state: web::Data<AppState>,
    last_heartbeat: Instant,
    ready_grace: Duration,
}

impl RelaySession {
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        stream_config: StreamConfig,
        app_state: web::Data<AppState>,
        ready_grace: Duration,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            bridge: UpstreamBridge::new(engine, stream_config),
            app_state,
            last_heartbeat: Instant::now(),
            ready_grace,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    session_id = %act.session_id,
                    "client heartbeat timed out, disconnecting"
                );
                act.bridge.shutdown(false);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_message(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(
                session_id = %self.session_id,
                error = %err,
                "failed to serialize server message"
            ),
        }
    }

    fn handle_command(&mut self, text: &str, _ctx: &mut ws::WebsocketContext<Self>) {
        // Undecodable text and unknown commands are ignored, not errors
        let Ok(command) = serde_json::from_str::<ClientCommand>(text) else {
            debug!(session_id = %self.session_id, "ignoring undecodable text frame");
            return;
        };

        match command.command.as_str() {
            ClientCommand::STOP_STREAMING => {
                if self.bridge.stop_streaming() {
                    info!(session_id = %self.session_id, "client stopped streaming, draining");
                } else {
                    debug!(
                        session_id = %self.session_id,
                        state = self.bridge.state_name(),
                        "stopStreaming with no stream to stop"
                    );
                }
            }
            other => {
                debug!(session_id = %self.session_id, command = other, "ignoring unknown command");
            }
        }
    }

    fn handle_audio_frame(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.bridge.on_audio_frame(data) {
            FrameOutcome::Forwarded { bytes } => {
                self.app_state.record_frame_forwarded(bytes);
            }
            FrameOutcome::Dropped(reason) => {
                self.app_state.record_frame_dropped();
                debug!(
                    session_id = %self.session_id,
                    reason = ?reason,
                    bytes = data.len(),
                    "dropped audio frame"
                );
            }
            FrameOutcome::Opened {
                generation,
                events,
                ready,
                pending,
            } => {
                info!(
                    session_id = %self.session_id,
                    generation,
                    "recognition stream opened"
                );
                self.attach_stream(generation, events, ready, pending, ctx);
            }
            FrameOutcome::StartFailed => {
                self.app_state.record_upstream_error();
                self.send_message(&ServerMessage::start_failure(), ctx);
            }
        }
    }

    /// Wire a freshly opened recognition stream into the actor: its events
    /// become an actor stream, and its deferred first frame is delivered once
    /// the readiness signal fires (bounded by the grace period).
    fn attach_stream(
        &mut self,
        generation: u64,
        events: mpsc::UnboundedReceiver<UpstreamEvent>,
        ready: oneshot::Receiver<()>,
        pending: Vec<u8>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        ctx.add_stream(
            UnboundedReceiverStream::new(events)
                .map(move |event| UpstreamDelivery { generation, event }),
        );

        let grace = self.ready_grace;
        ctx.spawn(
            async move {
                // On grace expiry the delivery is attempted anyway; the
                // bridge drops it if the stream still isn't writable
                let _ = tokio::time::timeout(grace, ready).await;
                (generation, pending)
            }
            .into_actor(self)
            .map(|(generation, pending), act, _ctx| {
                let bytes = pending.len();
                if act.bridge.deliver_pending(generation, pending) {
                    act.app_state.record_frame_forwarded(bytes);
                } else {
                    act.app_state.record_frame_dropped();
                    debug!(
                        session_id = %act.session_id,
                        generation,
                        "deferred first frame dropped, stream never became writable"
                    );
                }
            }),
        );
    }
}

impl Actor for RelaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "relay session connected");
        self.app_state.increment_active_sessions();
        self.start_heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Client is gone; half-close first so in-flight audio still gets
        // recognized server-side, then tear the stream down
        self.bridge.shutdown(true);
        self.app_state.decrement_active_sessions();
        info!(session_id = %self.session_id, "relay session disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_command(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio_frame(&data, ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, reason = ?reason, "client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented frames are not part of the protocol
                warn!(session_id = %self.session_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "websocket protocol error");
                self.bridge.shutdown(false);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<UpstreamDelivery> for RelaySession {
    fn handle(&mut self, delivery: UpstreamDelivery, ctx: &mut Self::Context) {
        match self.bridge.on_upstream_event(delivery.generation, delivery.event) {
            EventOutcome::Relay(message) => {
                self.app_state.record_transcript_relayed();
                self.send_message(&message, ctx);
            }
            EventOutcome::Fatal(message) => {
                self.app_state.record_upstream_error();
                self.send_message(&message, ctx);
            }
            EventOutcome::Closed => {
                debug!(
                    session_id = %self.session_id,
                    generation = delivery.generation,
                    "recognition stream closed"
                );
            }
            EventOutcome::Stale => {}
        }
    }

    // The default implementation stops the actor when a stream ends, but
    // recognition streams come and go within one client connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Build the per-stream recognition configuration from process configuration.
fn stream_config(config: &AppConfig) -> StreamConfig {
    StreamConfig {
        sample_rate: config.audio.sample_rate,
        language: config.engine.language.clone(),
        model: config.engine.model.clone(),
        punctuation: config.engine.punctuation,
        enhanced: config.engine.enhanced,
        interim_results: config.engine.interim_results,
    }
}

/// HTTP handler that upgrades `/ws/audio` requests into relay sessions.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    engine: web::Data<dyn RecognitionEngine>,
) -> Result<HttpResponse, Error> {
    let config = app_state.get_config();
    let session = RelaySession::new(
        engine.into_inner(),
        stream_config(&config),
        app_state.clone(),
        Duration::from_millis(config.audio.ready_grace_ms),
    );
    ws::start(session, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_mirrors_app_config() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 16000;
        config.engine.language = "de-DE".to_string();
        config.engine.interim_results = false;

        let stream = stream_config(&config);
        assert_eq!(stream.sample_rate, 16000);
        assert_eq!(stream.language, "de-DE");
        assert_eq!(stream.model, config.engine.model);
        assert!(!stream.interim_results);
        assert!(stream.punctuation);
    }
}
