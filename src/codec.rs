//! Codec identification and the per-container `CodecInfo` record.
//!
//! `CodecInfo` is produced once per playback by the media parser and consumed
//! read-only by the decoder element and the seek logic. M4A sample tables are
//! parsed into owned vectors here and never mutated afterwards.

use crate::extractor::aac::AacInfo;
use crate::extractor::m4a::M4aInfo;
use crate::extractor::mp3::Mp3Info;
use crate::extractor::wav::WavInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Mp3,
    Aac,
    M4a,
    Wav,
}

/// Per-container detail attached to a [`CodecInfo`].
#[derive(Debug, Clone)]
pub enum CodecDetail {
    Mp3(Mp3Info),
    Aac(AacInfo),
    M4a(M4aInfo),
    Wav(WavInfo),
}

#[derive(Debug, Clone)]
pub struct CodecInfo {
    pub kind: CodecKind,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
    /// Absolute byte offset of the first media payload byte (first frame / mdat / data).
    pub content_pos: u64,
    /// Total stream length in bytes; 0 when unknown.
    pub content_len: u64,
    /// Average payload rate; 0 when unknown (AAC, M4A).
    pub bytes_per_sec: u32,
    /// Total duration; 0 when unknown (raw ADTS).
    pub duration_ms: u32,
    pub detail: CodecDetail,
}

/// Identify the container from the first bytes of the stream.
///
/// `ID3`-tagged streams are ambiguous between MP3 and ADTS, so the URL is used
/// as a hint; an untagged syncword is MP3 unless both the URL says "aac" and the
/// sync looks like ADTS.
pub fn probe_codec(url: &str, head: &[u8]) -> Option<CodecKind> {
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Some(CodecKind::M4a);
    }
    if head.len() >= 4 && &head[0..4] == b"RIFF" {
        return Some(CodecKind::Wav);
    }
    if head.len() >= 3 && &head[0..3] == b"ID3" {
        if url.contains("aac") {
            return Some(CodecKind::Aac);
        }
        return Some(CodecKind::Mp3);
    }
    if head.len() >= 2 && head[0] == 0xFF && (head[1] & 0xE0) == 0xE0 {
        if url.contains("aac") && (head[1] & 0xF0) == 0xF0 {
            return Some(CodecKind::Aac);
        }
        return Some(CodecKind::Mp3);
    }
    None
}
