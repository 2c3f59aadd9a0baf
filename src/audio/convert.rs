//! # Audio Frame Conversion
//!
//! Converts inbound binary audio frames (32-bit float PCM, little-endian) into
//! the 16-bit signed PCM the recognition engine expects.
//!
//! ## Validation Rules:
//! A frame is converted only if its byte length is a non-zero multiple of 4
//! (the size of one f32 sample). Anything else is rejected whole - partial
//! conversion would desynchronize the sample stream. An empty frame is also
//! rejected: the upstream protocol uses an empty binary message as its
//! end-of-audio marker, so forwarding one would half-close the stream.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Size of one 32-bit float sample in bytes.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Convert one client audio frame to 16-bit little-endian PCM.
///
/// ## Conversion:
/// Each float sample `f` becomes `clamp(round(f * 32767), -32768, 32767)`.
/// This is a lossy, deterministic, per-sample scalar transform. Out-of-range
/// samples saturate; NaN maps to 0.
///
/// ## Returns:
/// - **Some(bytes)**: Converted PCM, exactly half the input length
/// - **None**: Frame is malformed (empty or not a multiple of 4 bytes)
pub fn convert_frame(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() % BYTES_PER_SAMPLE != 0 {
        return None;
    }

    let mut pcm = Vec::with_capacity(data.len() / 2);
    let mut cursor = Cursor::new(data);

    // Cursor reads handle arbitrary alignment of the source buffer
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        pcm.extend_from_slice(&float_to_i16(sample).to_le_bytes());
    }

    Some(pcm)
}

/// Convert a single float sample to a 16-bit signed integer sample.
fn float_to_i16(sample: f32) -> i16 {
    // `as i16` saturates, but only after round(); clamp first so the
    // contract is explicit. NaN falls through `as` to 0.
    (sample * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}
