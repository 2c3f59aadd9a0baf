//! # HTTP Request Handlers
//!
//! Plain HTTP endpoints living next to the WebSocket relay. These are
//! read-only: configuration is fixed for the lifetime of the process, so
//! there is no update surface.

pub mod config;      // GET /api/v1/config
