//! # Upstream Bridge
//!
//! The per-session state machine that sits between the client WebSocket and
//! the recognition engine. Kept free of actix types so the whole lifecycle is
//! unit-testable against a mock engine.
//!
//! ## Stream Lifecycle:
//! ```text
//! Idle ──audio──> Streaming ──stopStreaming──> Closing ──closed──> Terminated
//!   ^                 │                           │                    │
//!   └──open failed────┘        error──────────────┴───> Terminated     │
//!                                                                      │
//!                        new audio frame opens a fresh stream <────────┘
//! ```
//!
//! ## Generations:
//! Every opened stream gets a new generation number. Events from an old
//! stream (late transcripts, the trailing `Closed` after an error) carry
//! their stream's generation and are discarded when it no longer matches.

use crate::audio::convert::convert_frame;
use crate::engine::{
    OpenedStream, RecognitionEngine, StreamConfig, StreamHandle, UpstreamEvent,
};
use crate::relay::messages::ServerMessage;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Why an audio frame was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Empty, or byte length not a multiple of the f32 sample size.
    Malformed,

    /// Stream is half-closed and draining; late audio is discarded.
    Closing,

    /// Stream exists but is not (or no longer) accepting writes.
    NotWritable,
}

/// Result of feeding one binary frame into the bridge.
pub enum FrameOutcome {
    /// Frame was converted and written to the current stream.
    Forwarded { bytes: usize },

    /// Frame was discarded.
    Dropped(DropReason),

    /// A new recognition stream was opened for this frame. The converted
    /// frame is handed back as `pending`: the caller must wait for `ready`
    /// (bounded by the grace timeout) before delivering it.
    Opened {
        generation: u64,
        events: mpsc::UnboundedReceiver<UpstreamEvent>,
        ready: oneshot::Receiver<()>,
        pending: Vec<u8>,
    },

    /// The engine could not construct a stream. The bridge stays idle, so
    /// the next frame retries from scratch.
    StartFailed,
}

/// Result of applying one upstream event to the bridge.
#[derive(Debug, PartialEq)]
pub enum EventOutcome {
    /// Relay this payload to the client.
    Relay(ServerMessage),

    /// Relay this payload and note that the stream is gone for good.
    Fatal(ServerMessage),

    /// Stream closed without an error; nothing to relay.
    Closed,

    /// Event belongs to a stream the bridge has already moved past.
    Stale,
}

enum UpstreamState {
    /// No stream open. The next audio frame opens one.
    Idle,

    /// Stream open; audio is forwarded once the stream reports writable.
    Streaming(StreamHandle),

    /// Half-closed after `stopStreaming`; draining remaining transcripts.
    Closing(StreamHandle),

    /// Stream ended (error or close). The next audio frame opens a fresh one.
    Terminated,
}

impl UpstreamState {
    fn name(&self) -> &'static str {
        match self {
            UpstreamState::Idle => "idle",
            UpstreamState::Streaming(_) => "streaming",
            UpstreamState::Closing(_) => "closing",
            UpstreamState::Terminated => "terminated",
        }
    }
}

/// One client connection's view of the recognition engine.
pub struct UpstreamBridge {
    engine: Arc<dyn RecognitionEngine>,
    config: StreamConfig,
    state: UpstreamState,
    generation: u64,
}

impl UpstreamBridge {
    pub fn new(engine: Arc<dyn RecognitionEngine>, config: StreamConfig) -> Self {
        Self {
            engine,
            config,
            state: UpstreamState::Idle,
            generation: 0,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Feed one binary client frame through validation, conversion and the
    /// state machine.
    pub fn on_audio_frame(&mut self, data: &[u8]) -> FrameOutcome {
        let Some(pcm) = convert_frame(data) else {
            return FrameOutcome::Dropped(DropReason::Malformed);
        };

        match &self.state {
            UpstreamState::Streaming(handle) => {
                let bytes = pcm.len();
                if handle.write(pcm) {
                    FrameOutcome::Forwarded { bytes }
                } else {
                    FrameOutcome::Dropped(DropReason::NotWritable)
                }
            }
            UpstreamState::Closing(_) => FrameOutcome::Dropped(DropReason::Closing),
            UpstreamState::Idle | UpstreamState::Terminated => self.open_stream(pcm),
        }
    }

    fn open_stream(&mut self, pending: Vec<u8>) -> FrameOutcome {
        match self.engine.open_stream(&self.config) {
            Ok(OpenedStream {
                handle,
                events,
                ready,
            }) => {
                self.generation += 1;
                self.state = UpstreamState::Streaming(handle);
                debug!(generation = self.generation, "opened recognition stream");
                FrameOutcome::Opened {
                    generation: self.generation,
                    events,
                    ready,
                    pending,
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to open recognition stream");
                self.state = UpstreamState::Idle;
                FrameOutcome::StartFailed
            }
        }
    }

    /// Deliver the deferred first frame of a stream once its readiness signal
    /// fired (or the grace period ran out). Returns false if the frame had to
    /// be dropped: the stream was replaced, ended, or still isn't writable.
    pub fn deliver_pending(&mut self, generation: u64, pcm: Vec<u8>) -> bool {
        if generation != self.generation {
            return false;
        }
        match &self.state {
            UpstreamState::Streaming(handle) => handle.write(pcm),
            _ => false,
        }
    }

    /// Handle the client's `stopStreaming` command: half-close the stream and
    /// keep draining results. Returns false when there is nothing to stop.
    pub fn stop_streaming(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, UpstreamState::Terminated);
        match state {
            UpstreamState::Streaming(handle) if handle.is_writable() => {
                handle.finish();
                self.state = UpstreamState::Closing(handle);
                true
            }
            other => {
                // Not streaming yet (or anymore); nothing to half-close
                self.state = other;
                false
            }
        }
    }

    /// Apply one event read from a recognition stream's event channel.
    pub fn on_upstream_event(&mut self, generation: u64, event: UpstreamEvent) -> EventOutcome {
        if generation != self.generation {
            return EventOutcome::Stale;
        }

        match event {
            UpstreamEvent::Transcript { text, is_final } => match self.state {
                // Transcripts flow in both Streaming and the draining phase
                UpstreamState::Streaming(_) | UpstreamState::Closing(_) => {
                    EventOutcome::Relay(ServerMessage::transcript(text, is_final))
                }
                _ => EventOutcome::Stale,
            },
            UpstreamEvent::Error(message) => {
                match std::mem::replace(&mut self.state, UpstreamState::Terminated) {
                    UpstreamState::Streaming(handle) | UpstreamState::Closing(handle) => {
                        handle.abort();
                        EventOutcome::Fatal(ServerMessage::error(message))
                    }
                    other => {
                        self.state = other;
                        EventOutcome::Stale
                    }
                }
            }
            UpstreamEvent::Closed => {
                match std::mem::replace(&mut self.state, UpstreamState::Terminated) {
                    UpstreamState::Streaming(_) | UpstreamState::Closing(_) => EventOutcome::Closed,
                    other => {
                        // Trailing close of a stream that already errored
                        self.state = other;
                        EventOutcome::Stale
                    }
                }
            }
        }
    }

    /// Tear down whatever stream is open. Called when the client connection
    /// ends; graceful teardown half-closes first so in-flight audio still
    /// gets recognized server-side before the connection drops.
    pub fn shutdown(&mut self, graceful: bool) {
        match std::mem::replace(&mut self.state, UpstreamState::Terminated) {
            UpstreamState::Streaming(handle) => {
                if graceful {
                    handle.finish();
                }
                handle.abort();
            }
            UpstreamState::Closing(handle) => handle.abort(),
            UpstreamState::Idle | UpstreamState::Terminated => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, StreamInput};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Engine double that records every opened stream for inspection.
    #[derive(Default)]
    struct MockEngine {
        fail_next: AtomicBool,
        streams: Mutex<Vec<MockStream>>,
    }

    struct MockStream {
        input: mpsc::UnboundedReceiver<StreamInput>,
        events: mpsc::UnboundedSender<UpstreamEvent>,
        ready: Option<oneshot::Sender<()>>,
        writable: Arc<AtomicBool>,
    }

    impl MockStream {
        fn mark_ready(&mut self) {
            self.writable.store(true, Ordering::Release);
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
        }
    }

    impl RecognitionEngine for MockEngine {
        fn open_stream(&self, _config: &StreamConfig) -> Result<OpenedStream, EngineError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(EngineError::Stream("mock open failure".to_string()));
            }

            let (input_tx, input_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            let writable = Arc::new(AtomicBool::new(false));

            self.streams.lock().unwrap().push(MockStream {
                input: input_rx,
                events: event_tx,
                ready: Some(ready_tx),
                writable: writable.clone(),
            });

            Ok(OpenedStream {
                handle: StreamHandle::new(input_tx, writable),
                events: event_rx,
                ready: ready_rx,
            })
        }
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            sample_rate: 48000,
            language: "en-US".to_string(),
            model: "enhanced-streaming-v2".to_string(),
            punctuation: true,
            enhanced: true,
            interim_results: true,
        }
    }

    fn test_bridge() -> (UpstreamBridge, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        let bridge = UpstreamBridge::new(engine.clone(), test_config());
        (bridge, engine)
    }

    /// A valid frame of `n` zero-valued f32 samples.
    fn silent_frame(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 4]
    }

    fn take_stream(engine: &MockEngine, index: usize) -> MockStream {
        let mut streams = engine.streams.lock().unwrap();
        assert!(streams.len() > index, "stream {} was never opened", index);
        streams.remove(index)
    }

    #[tokio::test]
    async fn test_first_frame_opens_stream_and_defers() {
        let (mut bridge, engine) = test_bridge();
        assert_eq!(bridge.state_name(), "idle");

        let outcome = bridge.on_audio_frame(&silent_frame(2));
        let FrameOutcome::Opened {
            generation, pending, ..
        } = outcome
        else {
            panic!("first frame should open a stream");
        };
        assert_eq!(generation, 1);
        assert_eq!(pending.len(), 4); // 2 samples, converted to s16
        assert_eq!(bridge.state_name(), "streaming");

        // Stream not writable yet: follow-up frames are dropped, and the
        // pending frame cannot be delivered either
        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(2)),
            FrameOutcome::Dropped(DropReason::NotWritable)
        ));
        assert!(!bridge.deliver_pending(generation, pending.clone()));

        // Once ready, the pending frame goes through in order
        let mut stream = take_stream(&engine, 0);
        stream.mark_ready();
        assert!(bridge.deliver_pending(generation, pending));
        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(1)),
            FrameOutcome::Forwarded { bytes: 2 }
        ));

        let first = stream.input.recv().await.unwrap();
        assert!(matches!(first, StreamInput::Audio(pcm) if pcm.len() == 4));
        let second = stream.input.recv().await.unwrap();
        assert!(matches!(second, StreamInput::Audio(pcm) if pcm.len() == 2));
    }

    #[tokio::test]
    async fn test_malformed_frame_never_opens_a_stream() {
        let (mut bridge, engine) = test_bridge();

        assert!(matches!(
            bridge.on_audio_frame(&[0u8; 7]),
            FrameOutcome::Dropped(DropReason::Malformed)
        ));
        assert!(matches!(
            bridge.on_audio_frame(&[]),
            FrameOutcome::Dropped(DropReason::Malformed)
        ));

        assert_eq!(bridge.state_name(), "idle");
        assert!(engine.streams.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_bridge_retryable() {
        let (mut bridge, engine) = test_bridge();
        engine.fail_next.store(true, Ordering::SeqCst);

        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(2)),
            FrameOutcome::StartFailed
        ));
        assert_eq!(bridge.state_name(), "idle");

        // The very next frame retries and succeeds
        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(2)),
            FrameOutcome::Opened { generation: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_streaming_drains_then_terminates() {
        let (mut bridge, engine) = test_bridge();
        let FrameOutcome::Opened { generation, .. } = bridge.on_audio_frame(&silent_frame(2))
        else {
            panic!("expected stream open");
        };
        let mut stream = take_stream(&engine, 0);
        stream.mark_ready();

        assert!(bridge.stop_streaming());
        assert_eq!(bridge.state_name(), "closing");

        // Half-close went out on the wire
        stream.writable.store(false, Ordering::Release);
        assert!(matches!(
            stream.input.recv().await,
            Some(StreamInput::Finish)
        ));

        // Audio during the drain is dropped
        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(2)),
            FrameOutcome::Dropped(DropReason::Closing)
        ));

        // But late transcripts still flow to the client
        let outcome = bridge.on_upstream_event(
            generation,
            UpstreamEvent::Transcript {
                text: "final words".to_string(),
                is_final: true,
            },
        );
        assert_eq!(
            outcome,
            EventOutcome::Relay(ServerMessage::transcript("final words".to_string(), true))
        );

        // Stream close ends the drain
        assert_eq!(
            bridge.on_upstream_event(generation, UpstreamEvent::Closed),
            EventOutcome::Closed
        );
        assert_eq!(bridge.state_name(), "terminated");
    }

    #[tokio::test]
    async fn test_stop_ignored_before_stream_is_writable() {
        let (mut bridge, _engine) = test_bridge();
        assert!(!bridge.stop_streaming()); // Idle

        let _ = bridge.on_audio_frame(&silent_frame(2));
        assert!(!bridge.stop_streaming()); // Streaming but not yet writable
        assert_eq!(bridge.state_name(), "streaming");
    }

    #[tokio::test]
    async fn test_upstream_error_terminates_and_next_frame_reopens() {
        let (mut bridge, engine) = test_bridge();
        let FrameOutcome::Opened { generation, .. } = bridge.on_audio_frame(&silent_frame(2))
        else {
            panic!("expected stream open");
        };
        take_stream(&engine, 0).mark_ready();

        let outcome =
            bridge.on_upstream_event(generation, UpstreamEvent::Error("quota exceeded".to_string()));
        assert_eq!(
            outcome,
            EventOutcome::Fatal(ServerMessage::error("quota exceeded"))
        );
        assert_eq!(bridge.state_name(), "terminated");

        // The driver's trailing Closed for the dead stream is ignored
        assert_eq!(
            bridge.on_upstream_event(generation, UpstreamEvent::Closed),
            EventOutcome::Stale
        );

        // Resending audio starts a brand-new stream with a new generation
        assert!(matches!(
            bridge.on_audio_frame(&silent_frame(2)),
            FrameOutcome::Opened { generation: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_generation_events_discarded() {
        let (mut bridge, engine) = test_bridge();
        let _ = bridge.on_audio_frame(&silent_frame(2));
        take_stream(&engine, 0).mark_ready();

        // Events tagged with a generation the bridge never issued, or one it
        // has moved past, are discarded without touching the state machine
        assert_eq!(
            bridge.on_upstream_event(
                99,
                UpstreamEvent::Transcript {
                    text: "ghost".to_string(),
                    is_final: false,
                },
            ),
            EventOutcome::Stale
        );
        assert_eq!(
            bridge.on_upstream_event(0, UpstreamEvent::Error("old".to_string())),
            EventOutcome::Stale
        );
        assert_eq!(bridge.state_name(), "streaming");
    }

    #[tokio::test]
    async fn test_transcripts_relay_in_order_with_finality() {
        let (mut bridge, engine) = test_bridge();
        let FrameOutcome::Opened { generation, .. } = bridge.on_audio_frame(&silent_frame(2))
        else {
            panic!("expected stream open");
        };
        take_stream(&engine, 0).mark_ready();

        let interim = bridge.on_upstream_event(
            generation,
            UpstreamEvent::Transcript {
                text: "hel".to_string(),
                is_final: false,
            },
        );
        let settled = bridge.on_upstream_event(
            generation,
            UpstreamEvent::Transcript {
                text: "hello".to_string(),
                is_final: true,
            },
        );

        assert_eq!(
            interim,
            EventOutcome::Relay(ServerMessage::transcript("hel".to_string(), false))
        );
        assert_eq!(
            settled,
            EventOutcome::Relay(ServerMessage::transcript("hello".to_string(), true))
        );
    }

    #[tokio::test]
    async fn test_graceful_shutdown_half_closes_first() {
        let (mut bridge, engine) = test_bridge();
        let _ = bridge.on_audio_frame(&silent_frame(2));
        let mut stream = take_stream(&engine, 0);
        stream.mark_ready();

        bridge.shutdown(true);
        bridge.shutdown(true); // Idempotent

        assert!(matches!(
            stream.input.recv().await,
            Some(StreamInput::Finish)
        ));
        assert!(matches!(stream.input.recv().await, Some(StreamInput::Abort)));
        assert_eq!(bridge.state_name(), "terminated");

        // Late events from the torn-down stream do nothing
        let _ = stream.events.send(UpstreamEvent::Closed);
        assert_eq!(
            bridge.on_upstream_event(1, UpstreamEvent::Closed),
            EventOutcome::Stale
        );
    }
}
