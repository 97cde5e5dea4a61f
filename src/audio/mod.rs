//! Signal-level audio components.
//!
//! Everything here operates on raw bytes or PCM samples: container format
//! sniffing, incremental ffmpeg decode, energy-based voice activity
//! detection, and WAV framing for models that accept audio directly.

pub mod decode;
pub mod format;
pub mod vad;
pub mod wav;
