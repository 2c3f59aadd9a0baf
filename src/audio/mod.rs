//! # Audio Processing Module
//!
//! Handles conversion of inbound client audio into the format the recognition
//! engine is configured with.
//!
//! ## Audio Format Contract:
//! - **Client → Server**: 32-bit float PCM, little-endian, mono, samples in [-1.0, 1.0]
//! - **Server → Engine**: 16-bit signed PCM, little-endian, same sample rate
//!
//! There is no resampling, filtering, or buffering here: every well-formed
//! frame is converted sample-for-sample and forwarded immediately.

pub mod convert;     // f32 → i16 PCM frame conversion
