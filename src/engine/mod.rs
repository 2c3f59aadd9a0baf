//! # Recognition Engine Module
//!
//! Defines the seam between the relay and the cloud speech-recognition
//! service. The engine is an external collaborator: from the relay's point of
//! view it is an opaque bidirectional stream that accepts 16-bit PCM audio
//! and emits transcript events or errors.
//!
//! ## Key Components:
//! - **RecognitionEngine**: Factory trait - opens one streaming recognition call
//! - **StreamHandle**: The write side: `write`, `finish` (half-close), `abort`
//! - **UpstreamEvent**: The read side: transcript fragments, errors, close
//! - **Readiness signal**: One-shot fired when the stream becomes writable,
//!   so the first audio frame of a connection can be deferred instead of
//!   raced against connection establishment
//!
//! Opening a stream is synchronous from the caller's perspective: the
//! connection is established by a background task, and connection failures
//! surface as an `Error` event on the stream itself. A synchronous `Err`
//! from `open_stream` means the stream could not even be constructed.

pub mod cloud;       // Cloud provider streaming WebSocket client

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Fixed per-stream recognition configuration.
///
/// Derived from process configuration once at startup; every stream of every
/// session is opened with the same values. The audio encoding is always
/// signed 16-bit little-endian PCM, mono.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub language: String,
    pub model: String,
    pub punctuation: bool,
    pub enhanced: bool,
    pub interim_results: bool,
}

/// An event emitted by the recognition stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A recognized text fragment. `is_final` distinguishes interim results
    /// from settled ones and is relayed to the client verbatim.
    Transcript { text: String, is_final: bool },

    /// The stream failed. Terminal: no further audio will be accepted.
    Error(String),

    /// The stream closed (gracefully or after an error).
    Closed,
}

/// Errors constructing the engine or a stream.
#[derive(Debug)]
pub enum EngineError {
    /// Credential material could not be read or was empty.
    Credentials(String),

    /// The stream could not be constructed.
    Stream(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Credentials(msg) => write!(f, "credential error: {}", msg),
            EngineError::Stream(msg) => write!(f, "stream error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Input commands sent to the stream's driver task.
#[derive(Debug)]
pub(crate) enum StreamInput {
    /// One converted PCM frame.
    Audio(Vec<u8>),

    /// Half-close the write side; in-flight recognition keeps draining.
    Finish,

    /// Tear the stream down immediately.
    Abort,
}

/// The write side of an open recognition stream.
///
/// Cheap handle over the driver task's input channel. Dropping the handle
/// (without `finish` or `abort`) also tears the stream down, because the
/// driver observes the closed channel.
#[derive(Debug)]
pub struct StreamHandle {
    input: mpsc::UnboundedSender<StreamInput>,
    writable: Arc<AtomicBool>,
}

impl StreamHandle {
    pub(crate) fn new(
        input: mpsc::UnboundedSender<StreamInput>,
        writable: Arc<AtomicBool>,
    ) -> Self {
        Self { input, writable }
    }

    /// Whether the stream has connected and accepts audio.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Write one converted PCM frame. Returns false if the stream is not
    /// (or no longer) writable; the frame is dropped in that case.
    pub fn write(&self, pcm: Vec<u8>) -> bool {
        if !self.is_writable() {
            return false;
        }
        self.input.send(StreamInput::Audio(pcm)).is_ok()
    }

    /// Signal end-of-input without destroying the stream, so in-flight
    /// recognition can flush. Safe to call more than once.
    pub fn finish(&self) {
        let _ = self.input.send(StreamInput::Finish);
    }

    /// Force teardown. Safe to call more than once, and after `finish`.
    pub fn abort(&self) {
        let _ = self.input.send(StreamInput::Abort);
    }
}

/// Everything a freshly opened recognition stream hands back to its session.
pub struct OpenedStream {
    /// Write side of the stream.
    pub handle: StreamHandle,

    /// Read side: transcript/error/close events in emission order.
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,

    /// Fires once, when the stream becomes writable. Dropped without firing
    /// if the connection fails.
    pub ready: oneshot::Receiver<()>,
}

/// Factory for streaming recognition calls.
///
/// The relay holds one engine for the whole process; each session opens its
/// own streams through it. Implemented by [`cloud::CloudSpeechEngine`] in
/// production and by in-memory mocks in tests.
pub trait RecognitionEngine: Send + Sync {
    /// Open one streaming recognition call with the given configuration.
    fn open_stream(&self, config: &StreamConfig) -> Result<OpenedStream, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(writable: bool) -> (StreamHandle, mpsc::UnboundedReceiver<StreamInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = StreamHandle::new(tx, Arc::new(AtomicBool::new(writable)));
        (handle, rx)
    }

    #[tokio::test]
    async fn test_write_gated_on_writability() {
        let (handle, mut rx) = test_handle(false);
        assert!(!handle.write(vec![1, 2]));

        handle.writable.store(true, Ordering::Release);
        assert!(handle.write(vec![3, 4]));

        let input = rx.recv().await.unwrap();
        assert!(matches!(input, StreamInput::Audio(pcm) if pcm == vec![3, 4]));
    }

    #[tokio::test]
    async fn test_finish_then_abort_is_safe() {
        let (handle, mut rx) = test_handle(true);
        handle.finish();
        handle.finish();
        handle.abort();
        handle.abort();

        assert!(matches!(rx.recv().await, Some(StreamInput::Finish)));
        assert!(matches!(rx.recv().await, Some(StreamInput::Finish)));
        assert!(matches!(rx.recv().await, Some(StreamInput::Abort)));
        assert!(matches!(rx.recv().await, Some(StreamInput::Abort)));
    }

    #[test]
    fn test_teardown_after_driver_exit_does_not_panic() {
        let (handle, rx) = test_handle(true);
        drop(rx);  // Driver task gone
        assert!(!handle.write(vec![0; 4]));
        handle.finish();
        handle.abort();
    }
}
