//! # Relay Module
//!
//! The core of the server: WebSocket sessions that accept client audio,
//! forward it to the recognition engine, and relay transcripts back.
//!
//! ## Structure:
//! - **messages**: JSON payloads on the client-facing wire
//! - **bridge**: The per-session state machine (actor-free, unit-testable)
//! - **session**: The actix WebSocket actor wrapping a bridge

pub mod bridge;      // Session state machine over the recognition engine
pub mod messages;    // Client-facing wire messages
pub mod session;     // WebSocket actor and route handler

pub use session::audio_websocket;
