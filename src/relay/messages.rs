//! # Client Wire Messages
//!
//! JSON payloads exchanged with browser clients over the audio WebSocket.
//!
//! ## Protocol:
//! - **Client → Server (binary)**: raw f32le PCM audio frames
//! - **Client → Server (text)**: JSON commands, currently only `stopStreaming`
//! - **Server → Client (text)**: transcript or error payloads, defined here

use serde::{Deserialize, Serialize};

/// A text command sent by the client.
///
/// Unknown commands and undecodable text frames are ignored so protocol
/// additions on the client side never break older servers.
#[derive(Debug, Deserialize)]
pub struct ClientCommand {
    pub command: String,
}

impl ClientCommand {
    /// Half-close the current recognition stream and drain pending results.
    pub const STOP_STREAMING: &'static str = "stopStreaming";
}

/// A payload relayed to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A transcript fragment from the recognition stream, forwarded as-is.
    Transcript {
        transcript: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },

    /// A terminal error. After this, no more transcripts will arrive for the
    /// current stream; resending audio starts a fresh one.
    Error { error: String },
}

impl ServerMessage {
    pub fn transcript(text: String, is_final: bool) -> Self {
        ServerMessage::Transcript {
            transcript: text,
            is_final,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    /// Error sent when a recognition stream cannot even be constructed.
    pub fn start_failure() -> Self {
        Self::error("internal failure starting transcription")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_wire_shape() {
        let message = ServerMessage::transcript("hello world".to_string(), true);
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"transcript":"hello world","isFinal":true}"#
        );

        let interim = ServerMessage::transcript("hel".to_string(), false);
        assert_eq!(
            serde_json::to_string(&interim).unwrap(),
            r#"{"transcript":"hel","isFinal":false}"#
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let message = ServerMessage::error("stream failed");
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"error":"stream failed"}"#
        );
    }

    #[test]
    fn test_command_parsing() {
        let command: ClientCommand =
            serde_json::from_str(r#"{"command":"stopStreaming"}"#).unwrap();
        assert_eq!(command.command, ClientCommand::STOP_STREAMING);

        // Extra fields are tolerated
        let command: ClientCommand =
            serde_json::from_str(r#"{"command":"stopStreaming","requestId":7}"#).unwrap();
        assert_eq!(command.command, ClientCommand::STOP_STREAMING);

        // Missing command field fails to parse (and is then ignored upstream)
        assert!(serde_json::from_str::<ClientCommand>(r#"{"cmd":"stop"}"#).is_err());
    }
}
