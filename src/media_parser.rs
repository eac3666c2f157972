//! Media probing: identify the container, run the matching extractor, and hand
//! the still-open source handle back for the playback pipeline.
//!
//! The parser buffers the first couple of KiB so extractors can re-read the
//! header without touching the source again (which matters for one-shot
//! sources like TTS), and keeps a rolling tail of recently read bytes. After a
//! successful parse the handle is reused when the stream position can be
//! brought to the first frame either exactly or by stuffing the buffered tail
//! into the decoder's ringbuf; otherwise the handle is dropped and the
//! pipeline reopens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{CodecDetail, CodecInfo, CodecKind, probe_codec};
use crate::extractor::{self, ExtractError, Fetch};
use crate::m3u;
use crate::ringbuf::Ringbuf;
use crate::source::{RegisteredSource, SourceHandle};
use crate::{Error, Result};

const PARSER_BUFFER_SIZE: usize = 2048;
const DISCARD_MAX: u64 = 512 * 1024;
const REUSE_WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const MIN_PROBE_BYTES: usize = 256;

struct ParserFetch<'a> {
    handle: &'a mut dyn SourceHandle,
    /// The first bytes of the stream, replayable at will.
    header: Vec<u8>,
    /// Rolling tail of the bytes immediately before `content_pos`.
    tail: Vec<u8>,
}

impl ParserFetch<'_> {
    fn note_read(&mut self, data: &[u8]) {
        if data.len() >= PARSER_BUFFER_SIZE {
            self.tail.clear();
            self.tail
                .extend_from_slice(&data[data.len() - PARSER_BUFFER_SIZE..]);
        } else {
            self.tail.extend_from_slice(data);
            if self.tail.len() > PARSER_BUFFER_SIZE {
                let cut = self.tail.len() - PARSER_BUFFER_SIZE;
                self.tail.drain(..cut);
            }
        }
    }

    fn source_read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, ExtractError> {
        let n = self.handle.read(buf).map_err(|e| {
            warn!(%e, "parser source read failed");
            ExtractError::Io
        })?;
        self.note_read(&buf[..n]);
        Ok(n)
    }

    fn align_to(&mut self, offset: u64) -> std::result::Result<(), ExtractError> {
        let pos = self.handle.content_pos();
        if pos == offset {
            return Ok(());
        }
        if offset > pos && offset - pos <= DISCARD_MAX {
            debug!(discard = offset - pos, "discarding to reach parse offset");
            let mut scratch = [0u8; 1024];
            let mut remain = offset - pos;
            while remain > 0 {
                let want = (remain as usize).min(scratch.len());
                match self.source_read(&mut scratch[..want]) {
                    Ok(0) => return Err(ExtractError::Underflow),
                    Ok(n) => remain -= n as u64,
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }
        debug!(from = pos, to = offset, "seeking parse source");
        self.handle.seek(offset).map_err(|e| {
            warn!(%e, "parser source seek failed");
            ExtractError::Io
        })?;
        self.tail.clear();
        Ok(())
    }
}

impl Fetch for ParserFetch<'_> {
    fn fetch(&mut self, buf: &mut [u8], offset: u64) -> std::result::Result<usize, ExtractError> {
        // Requests inside the buffered header are served without source I/O, as
        // long as the handle still sits right past the header.
        let header_len = self.header.len() as u64;
        if offset < header_len && self.handle.content_pos() == header_len {
            let avail = (header_len - offset) as usize;
            let off = offset as usize;
            if avail >= buf.len() {
                buf.copy_from_slice(&self.header[off..off + buf.len()]);
                return Ok(buf.len());
            }
            buf[..avail].copy_from_slice(&self.header[off..]);
            let more = self.source_read(&mut buf[avail..])?;
            return Ok(avail + more);
        }

        self.align_to(offset)?;
        self.source_read(buf)
    }
}

/// A successful probe: codec info plus, when possible, the source handle with
/// the buffered tail bytes that precede its position.
pub struct ProbedMedia {
    pub codec: CodecInfo,
    pub handle: Box<dyn SourceHandle>,
    tail: Vec<u8>,
}

/// Open `url` (resolving m3u indirection) and extract its codec info.
pub fn probe(source: &RegisteredSource, url: &str) -> Result<ProbedMedia> {
    let mut media_url = url.to_string();
    if m3u::is_m3u(&media_url) {
        media_url = m3u::first_url(&source.adapter, &media_url)?;
        debug!(url = %media_url, "playlist resolved to first entry");
    }

    let mut handle = source.adapter.open(&media_url, 0)?;

    let header_size = PARSER_BUFFER_SIZE.min(source.buffer_size);
    let mut header = vec![0u8; header_size];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = handle.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < MIN_PROBE_BYTES {
        return Err(Error::UnsupportedMedia(format!(
            "only {filled} bytes readable from {media_url}"
        )));
    }
    header.truncate(filled);

    let kind = probe_codec(&media_url, &header)
        .ok_or_else(|| Error::UnsupportedMedia(format!("unrecognized container in {media_url}")))?;

    // The header bytes are exactly what precedes the handle's position, so they
    // seed the reuse tail.
    let tail_seed = header.clone();
    let mut fetch = ParserFetch {
        handle: handle.as_mut(),
        header,
        tail: tail_seed,
    };

    let codec = run_extractor(kind, &mut fetch)
        .map_err(|e| Error::UnsupportedMedia(format!("{kind:?} extractor failed: {e}")))?;
    let tail = std::mem::take(&mut fetch.tail);

    let content_len = handle.content_len();
    let codec = finish_codec_info(codec, content_len);
    info!(
        kind = ?codec.kind,
        sample_rate = codec.sample_rate,
        channels = codec.channels,
        bits = codec.bits,
        content_pos = codec.content_pos,
        content_len = codec.content_len,
        duration_ms = codec.duration_ms,
        "media probed"
    );
    Ok(ProbedMedia { codec, handle, tail })
}

fn run_extractor(kind: CodecKind, fetch: &mut dyn Fetch) -> std::result::Result<CodecInfo, ExtractError> {
    let mut codec = CodecInfo {
        kind,
        sample_rate: 0,
        channels: 0,
        bits: 16,
        content_pos: 0,
        content_len: 0,
        bytes_per_sec: 0,
        duration_ms: 0,
        detail: CodecDetail::Aac(Default::default()),
    };
    match kind {
        CodecKind::Mp3 => {
            let mut info = extractor::mp3::Mp3Info::default();
            extractor::mp3::extract(fetch, &mut info)?;
            codec.sample_rate = info.sample_rate;
            codec.channels = info.channels;
            codec.content_pos = info.frame_start_offset;
            codec.bytes_per_sec = info.bit_rate * 1000 / 8;
            codec.detail = CodecDetail::Mp3(info);
        }
        CodecKind::Aac => {
            let mut info = extractor::aac::AacInfo::default();
            extractor::aac::extract(fetch, &mut info)?;
            codec.sample_rate = info.sample_rate;
            codec.channels = info.channels;
            codec.content_pos = info.frame_start_offset;
            codec.detail = CodecDetail::Aac(info);
        }
        CodecKind::M4a => {
            let mut info = extractor::m4a::M4aInfo::default();
            extractor::m4a::extract(fetch, &mut info)?;
            codec.sample_rate = info.asc.sample_rate;
            codec.channels = info.asc.channels;
            codec.bits = if info.bits > 0 { info.bits } else { 16 };
            codec.content_pos = info.mdat_offset;
            codec.duration_ms = info.duration_ms();
            codec.detail = CodecDetail::M4a(info);
        }
        CodecKind::Wav => {
            let info = extractor::wav::extract(fetch)?;
            codec.sample_rate = info.sample_rate;
            codec.channels = info.channels;
            codec.bits = info.bits;
            codec.content_pos = info.data_offset as u64;
            codec.bytes_per_sec = info.block_align as u32 * info.sample_rate;
            codec.detail = CodecDetail::Wav(info);
        }
    }
    Ok(codec)
}

fn finish_codec_info(mut codec: CodecInfo, content_len: u64) -> CodecInfo {
    codec.content_len = content_len;
    match &codec.detail {
        CodecDetail::Mp3(info) => {
            if info.bit_rate > 0 && content_len > codec.content_pos {
                codec.duration_ms =
                    ((content_len - codec.content_pos) * 8 / info.bit_rate as u64) as u32;
            }
        }
        CodecDetail::Wav(info) => {
            if info.byte_rate > 0 {
                codec.duration_ms = (info.data_size as u64 * 1000 / info.byte_rate as u64) as u32;
            }
        }
        CodecDetail::Aac(_) | CodecDetail::M4a(_) => {}
    }
    codec
}

impl ProbedMedia {
    /// Try to reuse the probe handle for playback.
    ///
    /// Returns the handle when its position can be brought to the first frame:
    /// either exactly (possibly discarding forward up to 512 KiB), or by
    /// pre-loading the overshoot (`content_pos - frame_start`) from the
    /// buffered tail into the decoder's ringbuf.
    pub fn try_reuse_handle(mut self, ringbuf: &Ringbuf) -> (CodecInfo, Option<Box<dyn SourceHandle>>) {
        let frame_start = self.codec.content_pos;
        let mut pos = self.handle.content_pos();

        if frame_start > pos && frame_start - pos <= DISCARD_MAX {
            debug!(discard = frame_start - pos, "discarding to reach frame start");
            let mut scratch = [0u8; 1024];
            let mut remain = frame_start - pos;
            while remain > 0 {
                let want = (remain as usize).min(scratch.len());
                match self.handle.read(&mut scratch[..want]) {
                    Ok(n) if n > 0 => {
                        self.tail.extend_from_slice(&scratch[..n]);
                        remain -= n as u64;
                    }
                    _ => return (self.codec, None),
                }
            }
            pos = self.handle.content_pos();
        }

        if pos < frame_start {
            return (self.codec, None);
        }
        let overshoot = (pos - frame_start) as usize;
        if overshoot as u64 > self.tail.len() as u64 {
            return (self.codec, None);
        }

        if overshoot == 0 {
            debug!("reusing source handle at frame start");
            return (self.codec, Some(self.handle));
        }
        if ringbuf.capacity() >= overshoot {
            ringbuf.reset();
            let tail = &self.tail[self.tail.len() - overshoot..];
            if ringbuf.write_chunk(tail, Some(REUSE_WRITE_TIMEOUT)) == Ok(overshoot) {
                debug!(overshoot, "reusing source handle with buffered tail");
                return (self.codec, Some(self.handle));
            }
        }
        (self.codec, None)
    }
}

/// Compute the byte offset (relative to `content_pos`) for a seek.
///
/// MP3 and WAV use the average byte rate; M4A resolves the containing chunk
/// through the sample tables and also rewrites the decode cursor. ADTS has no
/// frame index and returns `None`, which the player treats as a successful
/// no-op (a knowingly lossy contract).
pub fn seek_offset(codec: &mut CodecInfo, seek_ms: u32) -> Option<u64> {
    let offset = match &mut codec.detail {
        CodecDetail::Mp3(_) | CodecDetail::Wav(_) => {
            Some(codec.bytes_per_sec as u64 * (seek_ms as u64 / 1000))
        }
        CodecDetail::M4a(info) => match extractor::m4a::seek_offset(info, seek_ms) {
            Some((sample_index, absolute)) => {
                info.stsz_index = sample_index;
                Some(absolute.saturating_sub(codec.content_pos))
            }
            None => None,
        },
        CodecDetail::Aac(_) => {
            warn!("seek unsupported for raw AAC streams");
            None
        }
    }?;
    if codec.content_len > 0 && codec.content_pos + offset >= codec.content_len {
        warn!(seek_ms, offset, "seek offset beyond content length");
        return None;
    }
    Some(offset)
}

/// Handle deposited by the async parser for the pipeline to pick up.
pub type HandoffSlot = Arc<Mutex<Option<Box<dyn SourceHandle>>>>;

pub type ParserCallback = Arc<dyn Fn(Result<CodecInfo>) + Send + Sync>;

/// Asynchronous probe on a short-lived thread.
pub struct ParserTask {
    stop: Arc<AtomicBool>,
}

impl ParserTask {
    pub fn start(
        source: RegisteredSource,
        url: String,
        ringbuf: Arc<Ringbuf>,
        handoff: HandoffSlot,
        callback: ParserCallback,
    ) -> crate::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = stop.clone();
        thread::Builder::new()
            .name("ael-parser".into())
            .spawn(move || {
                let result = probe(&source, &url);
                if task_stop.load(Ordering::SeqCst) {
                    debug!("parser finished after stop; dropping result");
                    return;
                }
                match result {
                    Ok(probed) => {
                        let (codec, handle) = probed.try_reuse_handle(&ringbuf);
                        if task_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        *handoff.lock().unwrap() = handle;
                        callback(Ok(codec));
                    }
                    Err(e) => callback(Err(e)),
                }
            })
            .map_err(|e| crate::Error::msg(format!("failed to spawn parser: {e}")))?;
        Ok(Self { stop })
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::wav::make_header;
    use crate::source::memory::MemorySource;
    use crate::source::{SourceAdapter, SourceRegistry};

    fn register_blob(url: &str, data: Vec<u8>) -> RegisteredSource {
        let registry = SourceRegistry::new();
        let mem = MemorySource::new("static");
        mem.register(url, data);
        registry.register(Arc::new(mem));
        registry.find(url).unwrap()
    }

    fn wav_blob(seconds: u32) -> Vec<u8> {
        let data_size = 16000 * 2 * seconds;
        let mut blob = make_header(16000, 1, 16, data_size);
        blob.resize(blob.len() + data_size as usize, 0x11);
        blob
    }

    #[test]
    fn probes_wav_and_reuses_handle_with_tail() {
        let source = register_blob("static://a.wav", wav_blob(2));
        let probed = probe(&source, "static://a.wav").unwrap();
        assert_eq!(probed.codec.kind, CodecKind::Wav);
        assert_eq!(probed.codec.sample_rate, 16000);
        assert_eq!(probed.codec.content_pos, 44);
        assert_eq!(probed.codec.duration_ms, 2000);

        // The probe consumed a 2 KiB header; reuse must stuff the overshoot
        // (2048 - 44 bytes) into the ringbuf.
        let ringbuf = Ringbuf::new(4096);
        let (codec, handle) = probed.try_reuse_handle(&ringbuf);
        let handle = handle.expect("handle reusable");
        assert_eq!(ringbuf.bytes_filled() as u64, handle.content_pos() - codec.content_pos);
    }

    #[test]
    fn reuse_declines_when_ringbuf_too_small() {
        let source = register_blob("static://a.wav", wav_blob(1));
        let probed = probe(&source, "static://a.wav").unwrap();
        let ringbuf = Ringbuf::new(256);
        let (_codec, handle) = probed.try_reuse_handle(&ringbuf);
        assert!(handle.is_none());
    }

    #[test]
    fn probe_rejects_non_media() {
        let source = register_blob("static://junk.bin", vec![0u8; 4096]);
        match probe(&source, "static://junk.bin") {
            Err(Error::UnsupportedMedia(_)) => {}
            other => panic!("expected UnsupportedMedia, got {other:?}", other = other.err()),
        }
    }

    #[test]
    fn probe_rejects_tiny_stream() {
        let source = register_blob("static://tiny", vec![0u8; 16]);
        assert!(probe(&source, "static://tiny").is_err());
    }

    #[test]
    fn mp3_duration_derives_from_bitrate() {
        // 128 kbps CBR: 10 seconds is 160_000 bytes of payload.
        let hdr = crate::extractor::mp3::frame_header(44100, 128, 2, false);
        let mut blob = Vec::new();
        let frame_size = 144000 * 128 / 44100;
        while blob.len() < 160_000 {
            blob.extend_from_slice(&hdr);
            blob.resize(blob.len() + frame_size - 4, 0x55);
        }
        blob.truncate(160_000);
        let source = register_blob("static://t.mp3", blob);
        let probed = probe(&source, "static://t.mp3").unwrap();
        assert_eq!(probed.codec.kind, CodecKind::Mp3);
        assert!((probed.codec.duration_ms as i64 - 10_000).abs() < 100);
    }

    #[test]
    fn seek_offset_uses_byte_rate_for_wav() {
        let source = register_blob("static://a.wav", wav_blob(4));
        let mut codec = probe(&source, "static://a.wav").unwrap().codec;
        let off = seek_offset(&mut codec, 2000).unwrap();
        assert_eq!(off, 2 * 32000);
        // Past-duration seeks resolve to nothing.
        assert!(seek_offset(&mut codec, 60_000).is_none());
    }

    #[test]
    fn seek_offset_is_none_for_aac() {
        let mut blob = crate::extractor::aac::adts_header(4, 2, 300).to_vec();
        blob.resize(4096, 0xAA);
        let source = register_blob("static://a.aac", blob);
        let mut codec = probe(&source, "static://a.aac").unwrap().codec;
        assert!(seek_offset(&mut codec, 1000).is_none());
    }

    #[test]
    fn m4a_probe_resolves_tables_and_seeks() {
        let blob = crate::extractor::m4a::testutil::build_m4a(40, 400, 8, true);
        let source = register_blob("static://a.m4a", blob);
        let mut codec = probe(&source, "static://a.m4a").unwrap().codec;
        assert_eq!(codec.kind, CodecKind::M4a);
        assert_eq!(codec.sample_rate, 44100);
        let off = seek_offset(&mut codec, 300).unwrap();
        // Relative to content start, chunk-aligned (8 frames of 400 bytes).
        assert_eq!(off % (8 * 400), 0);
        if let CodecDetail::M4a(info) = &codec.detail {
            assert_eq!(info.stsz_index % 8, 0);
        } else {
            panic!("wrong detail");
        }
    }

    #[test]
    fn async_parser_reports_and_deposits_handle() {
        let source = register_blob("static://a.wav", wav_blob(1));
        let ringbuf = Arc::new(Ringbuf::new(4096));
        let handoff: HandoffSlot = Arc::new(Mutex::new(None));
        let result: Arc<Mutex<Option<Result<CodecInfo>>>> = Arc::new(Mutex::new(None));
        let result_sink = result.clone();

        let _task = ParserTask::start(
            source,
            "static://a.wav".into(),
            ringbuf,
            handoff.clone(),
            Arc::new(move |res| {
                *result_sink.lock().unwrap() = Some(res);
            }),
        )
        .unwrap();

        for _ in 0..200 {
            if result.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let res = result.lock().unwrap().take().expect("parser finished");
        assert!(res.is_ok());
        assert!(handoff.lock().unwrap().is_some());
    }
}
