//! MP3 decoder element.
//!
//! Frames are pulled with a two-phase read: 4 header bytes first, the frame
//! length is derived from them, then the payload. After a seek the stream is
//! resynchronized by scanning a chunk for a header whose sample rate and
//! channel count match the probed stream before realigning the read window.

use symphonia::core::codecs::{CODEC_TYPE_MP3, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;
use tracing::{debug, error, warn};

use super::{FrameDecoder, FrameOutcome, InterleavedCopy, fill_pending};
use crate::element::{ElementIo, IoError, StreamInfo};
use crate::extractor::mp3::{Mp3Info, find_syncword, parse_header};

/// Large enough for the biggest legal MPEG1 L3 frame.
const INPUT_BUFFER_SIZE: usize = 1940;

pub struct Mp3Decoder {
    info: Mp3Info,
    dsp: Option<Box<dyn Decoder>>,
    copier: InterleavedCopy,
    pending: Vec<u8>,
    seek_mode: bool,
    eof: bool,
    stream_info: Option<StreamInfo>,
}

impl Mp3Decoder {
    pub fn new(info: Mp3Info) -> Self {
        Self {
            info,
            dsp: None,
            copier: InterleavedCopy::new(),
            pending: Vec::new(),
            seek_mode: false,
            eof: false,
            stream_info: None,
        }
    }

    fn make_dsp() -> Result<Box<dyn Decoder>, IoError> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_MP3);
        symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                error!(%e, "failed to create mp3 dsp");
                IoError::Fail
            })
    }

    /// Frame length from a header already known to be plausible; `None` for
    /// trailing garbage.
    fn frame_size_at(&self, buf: &[u8]) -> Option<usize> {
        let mut probe = Mp3Info::default();
        if buf.len() < 4 || parse_header(&buf[..4], &mut probe).is_err() {
            return None;
        }
        let size = probe.frame_size as usize;
        if size == 0 || size > INPUT_BUFFER_SIZE {
            return None;
        }
        Some(size)
    }

    /// Post-seek: scan `pending` for a header matching the probed stream and
    /// drop everything before it.
    fn resync_pending(&mut self) -> Result<(), IoError> {
        let mut pos = 0usize;
        while pos + 4 <= self.pending.len() {
            match find_syncword(&self.pending[pos..]) {
                Some(off) => {
                    pos += off;
                    let mut probe = Mp3Info::default();
                    if parse_header(&self.pending[pos..], &mut probe).is_ok()
                        && probe.sample_rate == self.info.sample_rate
                        && probe.channels == self.info.channels
                        && probe.frame_size as usize <= INPUT_BUFFER_SIZE
                    {
                        self.pending.drain(..pos);
                        debug!(skipped = pos, "resynchronized after seek");
                        return Ok(());
                    }
                    pos += 1;
                }
                None => break,
            }
        }
        error!("no valid frame header found after seek");
        Err(IoError::Fail)
    }
}

impl FrameDecoder for Mp3Decoder {
    fn open(&mut self) -> Result<(), IoError> {
        if self.dsp.is_none() {
            self.dsp = Some(Self::make_dsp()?);
        }
        Ok(())
    }

    fn decode_frame(&mut self, io: &mut ElementIo, out: &mut Vec<u8>) -> Result<FrameOutcome, IoError> {
        if self.eof {
            return Err(IoError::Done);
        }

        if self.seek_mode {
            match fill_pending(io, &mut self.pending, INPUT_BUFFER_SIZE) {
                Ok(()) => {}
                Err(IoError::Done) if self.pending.len() >= 4 => {}
                Err(IoError::Done) | Err(IoError::Abort) => {
                    self.eof = true;
                    return Err(IoError::Done);
                }
                Err(e) => return Err(e),
            }
            self.resync_pending()?;
            self.seek_mode = false;
        }

        // Phase one: frame header.
        match fill_pending(io, &mut self.pending, 4) {
            Ok(()) => {}
            Err(IoError::Done) | Err(IoError::Abort) => {
                self.eof = true;
                return Err(IoError::Done);
            }
            Err(e) => return Err(e),
        }
        let frame_size = match self.frame_size_at(&self.pending) {
            Some(size) => size,
            None => {
                // Trailing dummy bytes end the stream quietly.
                warn!("unparseable frame header, treating as end of stream");
                self.eof = true;
                return Err(IoError::Done);
            }
        };

        // Phase two: payload.
        match fill_pending(io, &mut self.pending, frame_size) {
            Ok(()) => {}
            Err(IoError::Done) | Err(IoError::Abort) => {
                self.eof = true;
                return Err(IoError::Done);
            }
            Err(e) => return Err(e),
        }

        let dsp = self.dsp.as_mut().ok_or(IoError::Fail)?;
        let packet = Packet::new_from_slice(0, 0, 0, &self.pending[..frame_size]);
        match dsp.decode(&packet) {
            Ok(decoded) => {
                if self.stream_info.is_none() {
                    let spec = *decoded.spec();
                    self.stream_info = Some(StreamInfo {
                        sample_rate: spec.rate,
                        channels: spec.channels.count() as u8,
                        bits: 16,
                    });
                }
                self.copier.append(decoded, out);
                self.pending.drain(..frame_size);
                Ok(FrameOutcome::Pcm)
            }
            Err(e) => {
                error!(%e, "mp3 dsp failed");
                Err(IoError::Fail)
            }
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info
    }

    fn seek(&mut self, _offset: u64) -> Result<(), IoError> {
        self.dsp = Some(Self::make_dsp()?);
        self.copier.reset();
        self.pending.clear();
        self.eof = false;
        self.seek_mode = true;
        Ok(())
    }

    fn close(&mut self) {
        self.dsp = None;
        self.copier.reset();
        self.pending.clear();
        self.seek_mode = false;
        self.eof = false;
        self.stream_info = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{
        Element, ElementConfig, ElementInput, ElementState, SinkWriter, SourceReader,
    };
    use crate::extractor::mp3::frame_header;
    use crate::ringbuf::Ringbuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn resync_skips_to_matching_header() {
        let mut dec = Mp3Decoder::new(Mp3Info {
            channels: 2,
            sample_rate: 44100,
            bit_rate: 128,
            frame_size: 417,
            frame_start_offset: 0,
        });
        // Garbage, then a 48 kHz header (wrong rate), then a matching frame
        // followed by the next frame's header so the double check passes.
        let matching = frame_header(44100, 128, 2, false);
        dec.pending.extend_from_slice(&[0x00, 0x12, 0x34]);
        dec.pending.extend_from_slice(&frame_header(48000, 128, 2, false));
        dec.pending.resize(dec.pending.len() + 60, 0);
        dec.pending.extend_from_slice(&matching);
        dec.pending.resize(dec.pending.len() + 413, 0);
        dec.pending.extend_from_slice(&matching);

        dec.resync_pending().unwrap();
        let mut probe = Mp3Info::default();
        parse_header(&dec.pending[..4], &mut probe).unwrap();
        assert_eq!(probe.sample_rate, 44100);
    }

    #[test]
    fn resync_fails_on_garbage() {
        let mut dec = Mp3Decoder::new(Mp3Info::default());
        dec.pending.resize(512, 0x00);
        assert!(dec.resync_pending().is_err());
    }

    struct NullSink;
    impl SinkWriter for NullSink {
        fn write(&mut self, buf: &[u8]) -> crate::element::IoResult {
            Ok(buf.len())
        }
    }

    /// Frame slicing against a ring-fed element: dummy tail bytes end the
    /// stream rather than erroring.
    #[test]
    fn dummy_tail_finishes_stream() {
        let ring = Arc::new(Ringbuf::new(8192));
        // One valid-looking header then nothing parseable.
        ring.write(&frame_header(44100, 128, 2, false), None).unwrap();
        ring.write(&vec![0u8; 413], None).unwrap();
        ring.write(&[0u8; 64], None).unwrap();
        ring.done_write();

        let states = Arc::new(Mutex::new(Vec::new()));
        let el = Element::spawn(ElementConfig {
            tag: "mp3_decoder".into(),
            input: ElementInput::Ring(ring),
            output: Box::new(NullSink),
            processor: Box::new(super::super::PcmPipe::new(Mp3Decoder::new(Mp3Info {
                channels: 2,
                sample_rate: 44100,
                bit_rate: 128,
                frame_size: 417,
                frame_start_offset: 0,
            }))),
            events: {
                let states = states.clone();
                Arc::new(move |_t, ev| {
                    states.lock().unwrap().push(format!("{ev:?}"));
                })
            },
            input_timeout: Some(Duration::from_millis(100)),
        })
        .unwrap();
        el.resume().unwrap();
        for _ in 0..200 {
            let s = el.state();
            if s == ElementState::Finished || s == ElementState::Error {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // The synthetic frame payload is not decodable; either outcome must be
        // terminal rather than a hang.
        assert!(matches!(
            el.state(),
            ElementState::Finished | ElementState::Error
        ));
    }

    struct ShortReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl SourceReader for ShortReader {
        fn read(&mut self, buf: &mut [u8], _t: Option<Duration>) -> crate::element::IoResult {
            if self.pos >= self.data.len() {
                return Err(IoError::Done);
            }
            // Two bytes at a time exercises partial-progress accumulation.
            let n = buf.len().min(2).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn header_accumulates_across_short_reads() {
        let mut io_data = frame_header(44100, 128, 2, false).to_vec();
        io_data.resize(417, 0xAB);
        let mut dec = Mp3Decoder::new(Mp3Info {
            channels: 2,
            sample_rate: 44100,
            bit_rate: 128,
            frame_size: 417,
            frame_start_offset: 0,
        });
        dec.open().unwrap();

        // Drive decode_frame directly over a scripted reader.
        let mut el_io = crate::element::test_io(
            ElementInput::Reader(Box::new(ShortReader { data: io_data, pos: 0 })),
            Box::new(NullSink),
        );
        let mut out = Vec::new();
        // The synthetic payload will not decode, but the framing must consume
        // the whole frame before failing, proving the two-phase read.
        let res = dec.decode_frame(&mut el_io, &mut out);
        // Either the synthetic payload decoded (frame drained, PCM out) or the
        // DSP rejected it after the full frame was assembled.
        match res {
            Ok(_) => assert!(dec.pending.is_empty()),
            Err(IoError::Fail) => assert_eq!(dec.pending.len(), 417),
            other => panic!("unexpected framing outcome: {other:?}"),
        }
    }
}
