//! Decoder elements.
//!
//! Every codec decoder follows the same element shape: drain any PCM left from
//! the previous frame to the sink, otherwise pull exactly one compressed frame
//! from the input, run it through the DSP, and stage the output. The shared
//! glue lives in [`PcmPipe`]; the per-codec frame framing and DSP calls live in
//! the [`FrameDecoder`] implementations.

pub mod aac;
pub mod mp3;
pub mod wav;

use std::sync::Arc;

use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};

use crate::codec::{CodecDetail, CodecInfo};
use crate::element::{ElementIo, IoError, IoResult, Processor, StreamInfo};

/// What one `decode_frame` call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// PCM was appended to the output scratch.
    Pcm,
    /// The frame was consumed without output (decoder resync, tolerated DSP
    /// error); call again.
    Skip,
}

pub trait FrameDecoder: Send + 'static {
    fn open(&mut self) -> Result<(), IoError>;
    /// Pull and decode one frame; append interleaved PCM to `out`.
    fn decode_frame(&mut self, io: &mut ElementIo, out: &mut Vec<u8>) -> Result<FrameOutcome, IoError>;
    /// Known once the first frame has decoded.
    fn stream_info(&self) -> Option<StreamInfo>;
    /// Reset DSP state ahead of decoding from a new position.
    fn seek(&mut self, offset: u64) -> Result<(), IoError>;
    fn close(&mut self);
}

/// Bytes of PCM between position reports on the event bus.
const POSITION_REPORT_INTERVAL: u64 = 64 * 1024;

/// Generic decoder element processor.
pub struct PcmPipe<D: FrameDecoder> {
    decoder: D,
    scratch: Vec<u8>,
    drained: usize,
    info_reported: bool,
    last_position_report: u64,
}

impl<D: FrameDecoder> PcmPipe<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            scratch: Vec::new(),
            drained: 0,
            info_reported: false,
            last_position_report: 0,
        }
    }

    fn maybe_report_position(&mut self, io: &ElementIo) {
        if io.byte_pos() >= self.last_position_report + POSITION_REPORT_INTERVAL {
            self.last_position_report = io.byte_pos();
            io.report_position();
        }
    }
}

impl<D: FrameDecoder> Processor for PcmPipe<D> {
    fn open(&mut self, _io: &mut ElementIo) -> Result<(), IoError> {
        self.decoder.open()
    }

    fn process(&mut self, io: &mut ElementIo) -> IoResult {
        if self.drained < self.scratch.len() {
            let n = io.write(&self.scratch[self.drained..])?;
            self.drained += n;
            if self.drained >= self.scratch.len() {
                self.scratch.clear();
                self.drained = 0;
            }
            self.maybe_report_position(io);
            return Ok(n);
        }

        self.scratch.clear();
        self.drained = 0;
        match self.decoder.decode_frame(io, &mut self.scratch)? {
            FrameOutcome::Skip => Ok(0),
            FrameOutcome::Pcm => {
                if !self.info_reported {
                    if let Some(info) = self.decoder.stream_info() {
                        io.info = info;
                        io.report_info();
                        self.info_reported = true;
                    }
                }
                let n = io.write(&self.scratch)?;
                self.drained = n;
                if self.drained >= self.scratch.len() {
                    self.scratch.clear();
                    self.drained = 0;
                }
                self.maybe_report_position(io);
                Ok(n)
            }
        }
    }

    fn seek(&mut self, _io: &mut ElementIo, offset: u64) -> Result<(), IoError> {
        self.scratch.clear();
        self.drained = 0;
        self.decoder.seek(offset)
    }

    fn close(&mut self, _io: &mut ElementIo, paused: bool) {
        if !paused {
            self.decoder.close();
            self.scratch.clear();
            self.drained = 0;
            self.info_reported = false;
            self.last_position_report = 0;
        }
    }
}

/// Build the decoder element processor matching the probed codec.
pub fn make_processor(codec: &CodecInfo) -> Box<dyn Processor> {
    match &codec.detail {
        CodecDetail::Mp3(info) => Box::new(PcmPipe::new(mp3::Mp3Decoder::new(*info))),
        CodecDetail::Aac(info) => Box::new(PcmPipe::new(aac::AacDecoder::adts(*info))),
        CodecDetail::M4a(info) => {
            Box::new(PcmPipe::new(aac::AacDecoder::m4a(Arc::new(info.clone()), codec.content_pos)))
        }
        CodecDetail::Wav(info) => Box::new(PcmPipe::new(wav::WavDecoder::new(info.clone()))),
    }
}

pub(crate) fn element_tag(codec: &CodecInfo) -> &'static str {
    match &codec.detail {
        CodecDetail::Mp3(_) => "mp3_decoder",
        CodecDetail::Aac(_) => "aac_decoder",
        CodecDetail::M4a(_) => "m4a_decoder",
        CodecDetail::Wav(_) => "wav_decoder",
    }
}

/// Copy a decoded symphonia buffer into interleaved little-endian i16 bytes.
pub(crate) struct InterleavedCopy {
    buf: Option<SampleBuffer<i16>>,
    spec: Option<SignalSpec>,
    capacity: u64,
}

impl InterleavedCopy {
    pub(crate) fn new() -> Self {
        Self {
            buf: None,
            spec: None,
            capacity: 0,
        }
    }

    pub(crate) fn append(&mut self, decoded: AudioBufferRef<'_>, out: &mut Vec<u8>) {
        let spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        if self.buf.is_none() || self.spec != Some(spec) || self.capacity < capacity {
            self.buf = Some(SampleBuffer::<i16>::new(capacity, spec));
            self.spec = Some(spec);
            self.capacity = capacity;
        }
        let buf = self.buf.as_mut().expect("sample buffer initialized");
        buf.copy_interleaved_ref(decoded);
        out.reserve(buf.samples().len() * 2);
        for s in buf.samples() {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buf = None;
        self.spec = None;
        self.capacity = 0;
    }
}

/// Accumulate up to `want` bytes into `pending`, tolerating short reads.
///
/// Partial progress stays in `pending` across calls: an input timeout surfaces
/// as `Timeout` so the element can report buffering and retry without losing
/// the bytes already read; end-of-stream maps to `Done`.
pub(crate) fn fill_pending(
    io: &mut ElementIo,
    pending: &mut Vec<u8>,
    want: usize,
) -> Result<(), IoError> {
    let mut tmp = [0u8; 1024];
    while pending.len() < want {
        let need = (want - pending.len()).min(tmp.len());
        match io.read(&mut tmp[..need]) {
            Ok(0) => return Err(IoError::Done),
            Ok(n) => pending.extend_from_slice(&tmp[..n]),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
