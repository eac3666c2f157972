//! WAV decoder element.
//!
//! PCM needs no DSP, only sample-width normalization. The input stream starts
//! at the `data` chunk; reads come in roughly 20 ms blocks and are converted to
//! the sink width: 8/16-bit sources play as 16-bit PCM, 24/32-bit and float
//! sources as 32-bit PCM.

use tracing::{error, warn};

use super::{FrameDecoder, FrameOutcome, fill_pending};
use crate::element::{ElementIo, IoError, StreamInfo};
use crate::extractor::wav::{WavFormat, WavInfo};

const BLOCK_MS: u32 = 20;

pub struct WavDecoder {
    info: WavInfo,
    sink_bits: u8,
    block_bytes: usize,
    pending: Vec<u8>,
    eof: bool,
    started: bool,
}

/// The one fixed promotion rule: narrow sources stay 16-bit, wide and float
/// sources widen to 32-bit.
pub(crate) fn sink_bits_for(info: &WavInfo) -> u8 {
    match (info.format, info.bits) {
        (WavFormat::IeeeFloat, _) => 32,
        (_, bits) if bits > 16 => 32,
        _ => 16,
    }
}

impl WavDecoder {
    pub fn new(info: WavInfo) -> Self {
        let frames = (info.sample_rate * BLOCK_MS / 1000).max(1) as usize;
        let block_bytes = frames * info.block_align.max(1) as usize;
        let sink_bits = sink_bits_for(&info);
        Self {
            info,
            sink_bits,
            block_bytes,
            pending: Vec::new(),
            eof: false,
            started: false,
        }
    }

    fn convert(&self, src: &[u8], out: &mut Vec<u8>) {
        match (self.info.format, self.info.bits) {
            (WavFormat::Pcm, 16) => out.extend_from_slice(src),
            (WavFormat::Pcm, 8) => {
                for &b in src {
                    let s = ((b as i16) - 128) << 8;
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
            (WavFormat::Pcm, 24) => {
                for sample in src.chunks_exact(3) {
                    let v = i32::from_le_bytes([0, sample[0], sample[1], sample[2]]);
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            (WavFormat::Pcm, 32) => out.extend_from_slice(src),
            (WavFormat::IeeeFloat, 32) => {
                for sample in src.chunks_exact(4) {
                    let f = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    let v = (f.clamp(-1.0, 1.0) * i32::MAX as f32) as i32;
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            (format, bits) => {
                // Guarded at open; nothing sensible to emit here.
                warn!(?format, bits, "unsupported wav payload reached convert");
            }
        }
    }
}

impl FrameDecoder for WavDecoder {
    fn open(&mut self) -> Result<(), IoError> {
        match self.info.format {
            WavFormat::Pcm | WavFormat::IeeeFloat => Ok(()),
            other => {
                error!(format = ?other, "wav format not supported by this decoder");
                Err(IoError::Fail)
            }
        }
    }

    fn decode_frame(&mut self, io: &mut ElementIo, out: &mut Vec<u8>) -> Result<FrameOutcome, IoError> {
        if self.eof {
            return Err(IoError::Done);
        }
        match fill_pending(io, &mut self.pending, self.block_bytes) {
            Ok(()) => {}
            Err(IoError::Done) | Err(IoError::Abort) => {
                self.eof = true;
                if self.pending.is_empty() {
                    return Err(IoError::Done);
                }
            }
            Err(e) => return Err(e),
        }

        // Convert only whole sample frames; a short tail rides along to the
        // next call (or is dropped at EOF if not frame-aligned).
        let align = self.info.block_align.max(1) as usize;
        let whole = self.pending.len() / align * align;
        if whole == 0 {
            return if self.eof {
                Err(IoError::Done)
            } else {
                Ok(FrameOutcome::Skip)
            };
        }
        let tail = self.pending.split_off(whole);
        let block = std::mem::replace(&mut self.pending, tail);
        self.convert(&block, out);
        self.started = true;
        Ok(FrameOutcome::Pcm)
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.started.then_some(StreamInfo {
            sample_rate: self.info.sample_rate,
            channels: self.info.channels,
            bits: self.sink_bits,
        })
    }

    fn seek(&mut self, _offset: u64) -> Result<(), IoError> {
        self.pending.clear();
        self.eof = false;
        Ok(())
    }

    fn close(&mut self) {
        self.pending.clear();
        self.eof = false;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementInput, SinkWriter, test_io};
    use crate::extractor::wav::parse_header;
    use crate::ringbuf::Ringbuf;
    use std::sync::Arc;

    fn wav_info(bits: u16, format_override: Option<WavFormat>) -> WavInfo {
        let data = crate::extractor::wav::make_header(16000, 1, bits, 0);
        let mut info = parse_header(&data).unwrap();
        if let Some(f) = format_override {
            info.format = f;
        }
        info
    }

    struct NullSink;
    impl SinkWriter for NullSink {
        fn write(&mut self, buf: &[u8]) -> crate::element::IoResult {
            Ok(buf.len())
        }
    }

    fn ring_input(data: &[u8]) -> ElementInput {
        let rb = Arc::new(Ringbuf::new(64 * 1024));
        rb.write(data, None).unwrap();
        rb.done_write();
        ElementInput::Ring(rb)
    }

    #[test]
    fn promotion_rule_is_fixed() {
        assert_eq!(sink_bits_for(&wav_info(8, None)), 16);
        assert_eq!(sink_bits_for(&wav_info(16, None)), 16);
        assert_eq!(sink_bits_for(&wav_info(24, None)), 32);
        assert_eq!(sink_bits_for(&wav_info(32, None)), 32);
        assert_eq!(sink_bits_for(&wav_info(32, Some(WavFormat::IeeeFloat))), 32);
    }

    #[test]
    fn sixteen_bit_passthrough() {
        let mut dec = WavDecoder::new(wav_info(16, None));
        dec.open().unwrap();
        let samples: Vec<u8> = (0..640u32).flat_map(|i| (i as i16).to_le_bytes()).collect();
        let mut io = test_io(ring_input(&samples), Box::new(NullSink));
        let mut out = Vec::new();
        loop {
            match dec.decode_frame(&mut io, &mut out) {
                Ok(_) => {}
                Err(IoError::Done) => break,
                Err(e) => panic!("unexpected: {e:?}"),
            }
        }
        assert_eq!(out, samples);
        assert_eq!(
            dec.stream_info(),
            Some(StreamInfo {
                sample_rate: 16000,
                channels: 1,
                bits: 16
            })
        );
    }

    #[test]
    fn eight_bit_promotes_to_sixteen() {
        let mut dec = WavDecoder::new(wav_info(8, None));
        dec.open().unwrap();
        let mut io = test_io(ring_input(&[0u8, 128, 255]), Box::new(NullSink));
        let mut out = Vec::new();
        let _ = dec.decode_frame(&mut io, &mut out);
        let s0 = i16::from_le_bytes([out[0], out[1]]);
        let s1 = i16::from_le_bytes([out[2], out[3]]);
        let s2 = i16::from_le_bytes([out[4], out[5]]);
        assert_eq!(s0, -32768);
        assert_eq!(s1, 0);
        assert_eq!(s2, 127 << 8);
    }

    #[test]
    fn twentyfour_bit_widens_to_thirtytwo() {
        let mut dec = WavDecoder::new(wav_info(24, None));
        dec.open().unwrap();
        // +1 in 24-bit LE.
        let mut io = test_io(ring_input(&[0x01, 0x00, 0x00]), Box::new(NullSink));
        let mut out = Vec::new();
        let _ = dec.decode_frame(&mut io, &mut out);
        let v = i32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(v, 1 << 8);
    }

    #[test]
    fn adpcm_is_rejected_at_open() {
        let mut dec = WavDecoder::new(wav_info(16, Some(WavFormat::Adpcm)));
        assert!(matches!(dec.open(), Err(IoError::Fail)));
    }

    #[test]
    fn short_tail_is_dropped_at_eof() {
        let mut info = wav_info(16, None);
        info.channels = 2;
        info.block_align = 4;
        let mut dec = WavDecoder::new(info);
        dec.open().unwrap();
        // Ten full frames plus a ragged 3-byte tail.
        let mut data = vec![0u8; 43];
        data[0] = 7;
        let mut io = test_io(ring_input(&data), Box::new(NullSink));
        let mut out = Vec::new();
        let mut total = 0;
        loop {
            match dec.decode_frame(&mut io, &mut out) {
                Ok(_) => {
                    total = out.len();
                }
                Err(IoError::Done) => break,
                Err(e) => panic!("unexpected: {e:?}"),
            }
        }
        assert_eq!(total, 40);
    }
}
