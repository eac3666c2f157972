//! `talkbox` — the client-side voice-interaction runtime for a cloud-connected
//! smart speaker.
//!
//! This crate provides:
//! - A four-stream audio player (music, prompt, TTS, wake prompt) with its own
//!   decode pipeline (MP3 / AAC-ADTS / M4A / WAV) over pluggable sources
//! - A bounded-utterance recorder streaming 16 kHz PCM frames to the service
//! - The dialog coordinator gluing both to the cloud transport
//! - The `Sdk` facade an embedder wires to its vendor audio adapter
//!
//! The library is designed for long-running device firmware, with an emphasis
//! on explicit state machines, clean cancellation, and minimal surprises.

// The dialog-facing surface.
pub mod protocol;
pub mod sdk;
pub mod service;
pub mod vendor;

// Playback: the per-URL player and the multi-stream layer above it.
pub mod arbiter;
pub mod player;
pub mod prompts;
pub mod stream_player;
pub mod tts_player;

// Capture.
pub mod recorder;

// The decode pipeline.
pub mod codec;
pub mod decoder;
pub mod element;
pub mod extractor;
pub mod media_parser;
pub mod media_source;

// I/O building blocks.
pub mod m3u;
pub mod ringbuf;
pub mod sink;
pub mod source;

// Error handling and logging configuration.
mod error;
pub mod logging;

pub use error::{Error, Result};
