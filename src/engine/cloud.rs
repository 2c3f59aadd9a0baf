//! # Cloud Speech Provider Client
//!
//! Drives one streaming recognition call against the provider's realtime
//! WebSocket API. Protocol:
//!
//! 1. Connect to the configured endpoint
//! 2. Send a JSON start request carrying the API key and the fixed
//!    recognition configuration (model, language, sample rate, flags)
//! 3. Stream raw s16le PCM as binary messages
//! 4. An empty binary message marks end-of-audio (half-close); the server
//!    keeps emitting results until it has drained, then closes
//! 5. Server text messages carry recognition results or an error payload
//!
//! The connection is owned by a background driver task; the session only ever
//! holds a [`StreamHandle`]. Connection failures, read failures and server
//! error payloads all surface as [`UpstreamEvent::Error`] followed by
//! [`UpstreamEvent::Closed`].

use crate::config::EngineConfig;
use crate::engine::{
    EngineError, OpenedStream, RecognitionEngine, StreamConfig, StreamHandle, StreamInput,
    UpstreamEvent,
};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Start request sent as the first message of every stream.
#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    api_key: &'a str,
    model: &'a str,
    language: &'a str,
    /// Always signed 16-bit little-endian PCM; the relay converts client
    /// float frames before they reach this stream.
    audio_format: &'a str,
    sample_rate: u32,
    enable_punctuation: bool,
    use_enhanced: bool,
    interim_results: bool,
}

/// One server payload. Either recognition results or an error.
#[derive(Debug, Default, Deserialize)]
struct RecognitionPayload {
    #[serde(default)]
    results: Vec<RecognitionResult>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<RecognitionAlternative>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RecognitionAlternative {
    #[serde(default)]
    transcript: String,
}

/// Extract a usable transcript event from a server payload.
///
/// A payload is usable if it carries at least one result with at least one
/// alternative holding a non-empty transcript. Anything else is ignored -
/// not forwarded, not an error.
fn transcript_event(payload: &RecognitionPayload) -> Option<UpstreamEvent> {
    let result = payload.results.first()?;
    let alternative = result.alternatives.first()?;
    if alternative.transcript.is_empty() {
        return None;
    }
    Some(UpstreamEvent::Transcript {
        text: alternative.transcript.clone(),
        is_final: result.is_final,
    })
}

/// Recognition engine backed by the provider's streaming WebSocket API.
///
/// Constructed once at startup. Reads the API key from the configured
/// credentials file; failure here is fatal and aborts the process.
pub struct CloudSpeechEngine {
    endpoint: String,
    api_key: String,
    connect_timeout: Duration,
}

impl CloudSpeechEngine {
    /// Build the engine from process configuration, reading credential
    /// material from disk.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(&config.credentials_path).map_err(|err| {
            EngineError::Credentials(format!(
                "failed to read credentials file '{}': {}",
                config.credentials_path, err
            ))
        })?;

        let api_key = raw.trim().to_string();
        if api_key.is_empty() {
            return Err(EngineError::Credentials(format!(
                "credentials file '{}' is empty",
                config.credentials_path
            )));
        }

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }
}

impl RecognitionEngine for CloudSpeechEngine {
    fn open_stream(&self, config: &StreamConfig) -> Result<OpenedStream, EngineError> {
        let start = StartRequest {
            api_key: &self.api_key,
            model: &config.model,
            language: &config.language,
            audio_format: "pcm_s16le",
            sample_rate: config.sample_rate,
            enable_punctuation: config.punctuation,
            use_enhanced: config.enhanced,
            interim_results: config.interim_results,
        };
        let start_payload = serde_json::to_string(&start)
            .map_err(|err| EngineError::Stream(format!("failed to build start request: {}", err)))?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let writable = Arc::new(AtomicBool::new(false));

        let endpoint = self.endpoint.clone();
        let connect_timeout = self.connect_timeout;
        let task_writable = writable.clone();

        // The driver owns the WebSocket for the stream's whole lifetime.
        tokio::spawn(async move {
            let result = drive_stream(
                endpoint,
                connect_timeout,
                start_payload,
                input_rx,
                ready_tx,
                task_writable.clone(),
                event_tx.clone(),
            )
            .await;

            task_writable.store(false, Ordering::Release);
            if let Err(err) = result {
                warn!(error = %err, "recognition stream failed");
                let _ = event_tx.send(UpstreamEvent::Error(err.to_string()));
            }
            let _ = event_tx.send(UpstreamEvent::Closed);
        });

        Ok(OpenedStream {
            handle: StreamHandle::new(input_tx, writable),
            events: event_rx,
            ready: ready_rx,
        })
    }
}

/// Run one recognition stream to completion.
async fn drive_stream(
    endpoint: String,
    connect_timeout: Duration,
    start_payload: String,
    mut input: mpsc::UnboundedReceiver<StreamInput>,
    ready: oneshot::Sender<()>,
    writable: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
) -> Result<()> {
    let (stream, _) = timeout(connect_timeout, connect_async(&endpoint))
        .await
        .map_err(|_| anyhow!("timed out connecting to recognition endpoint"))?
        .context("failed to connect to recognition endpoint")?;

    let (mut write, mut read) = stream.split();

    write
        .send(Message::Text(start_payload))
        .await
        .context("failed to send recognition start request")?;

    // Stream is writable from here on; release the deferred first frame.
    writable.store(true, Ordering::Release);
    let _ = ready.send(());

    let mut draining = false;

    loop {
        tokio::select! {
            command = input.recv() => {
                match command {
                    Some(StreamInput::Audio(pcm)) => {
                        if draining {
                            // Write side already half-closed
                            debug!(bytes = pcm.len(), "dropping audio received while draining");
                            continue;
                        }
                        write
                            .send(Message::Binary(pcm))
                            .await
                            .context("failed to write audio to recognition stream")?;
                    }
                    Some(StreamInput::Finish) => {
                        if draining {
                            continue;
                        }
                        writable.store(false, Ordering::Release);
                        // Empty binary message is the provider's end-of-audio marker
                        write
                            .send(Message::Binary(Vec::new()))
                            .await
                            .context("failed to half-close recognition stream")?;
                        write
                            .flush()
                            .await
                            .context("failed to flush recognition stream")?;
                        draining = true;
                        debug!("recognition stream half-closed, draining");
                    }
                    Some(StreamInput::Abort) | None => {
                        // Forced teardown, or the session dropped its handle
                        writable.store(false, Ordering::Release);
                        let _ = write.send(Message::Close(None)).await;
                        debug!("recognition stream torn down");
                        return Ok(());
                    }
                }
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let frame = frame.context("recognition stream read failed")?;
                match frame {
                    Message::Text(text) => {
                        let payload: RecognitionPayload = match serde_json::from_str(&text) {
                            Ok(payload) => payload,
                            Err(err) => {
                                debug!(error = %err, "ignoring undecodable recognition payload");
                                continue;
                            }
                        };

                        if payload.error_code.is_some() || payload.error_message.is_some() {
                            let message = payload
                                .error_message
                                .unwrap_or_else(|| "recognition stream error".to_string());
                            match payload.error_code {
                                Some(code) => return Err(anyhow!("{} (code {})", message, code)),
                                None => return Err(anyhow!("{}", message)),
                            }
                        }

                        if let Some(event) = transcript_event(&payload) {
                            if events.send(event).is_err() {
                                // Session is gone; nothing left to relay to
                                return Ok(());
                            }
                        }
                    }
                    Message::Close(_) => {
                        debug!("recognition stream closed by server");
                        return Ok(());
                    }
                    // Ping/pong are handled by tungstenite internals; server
                    // binary frames are not part of the protocol
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_extraction() {
        let payload: RecognitionPayload = serde_json::from_str(
            r#"{"results":[{"alternatives":[{"transcript":"hello world"}],"is_final":true}]}"#,
        )
        .unwrap();

        assert_eq!(
            transcript_event(&payload),
            Some(UpstreamEvent::Transcript {
                text: "hello world".to_string(),
                is_final: true,
            })
        );
    }

    #[test]
    fn test_interim_flag_preserved() {
        let payload: RecognitionPayload = serde_json::from_str(
            r#"{"results":[{"alternatives":[{"transcript":"hel"}]}]}"#,
        )
        .unwrap();

        assert_eq!(
            transcript_event(&payload),
            Some(UpstreamEvent::Transcript {
                text: "hel".to_string(),
                is_final: false,
            })
        );
    }

    #[test]
    fn test_unusable_payloads_ignored() {
        // No results at all
        let payload: RecognitionPayload = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(transcript_event(&payload), None);

        // Result without alternatives
        let payload: RecognitionPayload =
            serde_json::from_str(r#"{"results":[{"is_final":true}]}"#).unwrap();
        assert_eq!(transcript_event(&payload), None);

        // Empty transcript
        let payload: RecognitionPayload = serde_json::from_str(
            r#"{"results":[{"alternatives":[{"transcript":""}]}]}"#,
        )
        .unwrap();
        assert_eq!(transcript_event(&payload), None);
    }

    #[test]
    fn test_engine_rejects_missing_credentials() {
        let config = EngineConfig {
            endpoint: "wss://stt.example-speech.dev/v1/stream".to_string(),
            credentials_path: "/nonexistent/credentials/key".to_string(),
            model: "enhanced-streaming-v2".to_string(),
            language: "en-US".to_string(),
            punctuation: true,
            enhanced: true,
            interim_results: true,
            connect_timeout_ms: 1000,
        };

        assert!(matches!(
            CloudSpeechEngine::from_config(&config),
            Err(EngineError::Credentials(_))
        ));
    }

    #[test]
    fn test_engine_reads_and_trims_credentials() {
        let path = std::env::temp_dir().join(format!(
            "speech-relay-credentials-{}",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, "  test-api-key-123\n").unwrap();

        let config = EngineConfig {
            endpoint: "wss://stt.example-speech.dev/v1/stream".to_string(),
            credentials_path: path.to_string_lossy().to_string(),
            model: "enhanced-streaming-v2".to_string(),
            language: "en-US".to_string(),
            punctuation: true,
            enhanced: true,
            interim_results: true,
            connect_timeout_ms: 1000,
        };

        let engine = CloudSpeechEngine::from_config(&config).unwrap();
        assert_eq!(engine.api_key, "test-api-key-123");

        fs::write(&path, "   \n").unwrap();
        assert!(matches!(
            CloudSpeechEngine::from_config(&config),
            Err(EngineError::Credentials(_))
        ));

        let _ = fs::remove_file(&path);
    }
}
