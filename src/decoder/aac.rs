//! AAC decoder element, covering both framings:
//!
//! - **ADTS**: each frame carries its own 7-byte header (9 with CRC); the
//!   payload length comes from the header and the decoder is configured with an
//!   AudioSpecificConfig synthesized from the first header's fields.
//! - **M4A**: frames are exact `stsz` entries; the ASC from `esds` is pushed to
//!   the DSP before the first frame and the cursor walks the sample table.
//!
//! Transient DSP failures skip the frame; four consecutive failures take the
//! element down.

use std::sync::Arc;

use symphonia::core::audio::Channels;
use symphonia::core::codecs::{CODEC_TYPE_AAC, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::Packet;
use tracing::{debug, error, warn};

use super::{FrameDecoder, FrameOutcome, InterleavedCopy, fill_pending};
use crate::element::{ElementIo, IoError, StreamInfo};
use crate::extractor::aac::{ADTS_HEADER_LEN, AacInfo, adts_to_asc, parse_adts_header};
use crate::extractor::m4a::M4aInfo;

const MAX_DECODE_FAILURES: u32 = 4;

enum Framing {
    Adts { info: AacInfo },
    M4a {
        info: Arc<M4aInfo>,
        /// First media byte of the stream, for mapping seek offsets to chunks.
        content_pos: u64,
        cursor: u32,
    },
}

pub struct AacDecoder {
    framing: Framing,
    dsp: Option<Box<dyn Decoder>>,
    copier: InterleavedCopy,
    pending: Vec<u8>,
    fail_streak: u32,
    eof: bool,
    stream_info: Option<StreamInfo>,
}

impl AacDecoder {
    pub fn adts(info: AacInfo) -> Self {
        Self::new(Framing::Adts { info })
    }

    pub fn m4a(info: Arc<M4aInfo>, content_pos: u64) -> Self {
        let cursor = info.stsz_index;
        Self::new(Framing::M4a {
            info,
            content_pos,
            cursor,
        })
    }

    fn new(framing: Framing) -> Self {
        Self {
            framing,
            dsp: None,
            copier: InterleavedCopy::new(),
            pending: Vec::new(),
            fail_streak: 0,
            eof: false,
            stream_info: None,
        }
    }

    fn asc(&self) -> Vec<u8> {
        match &self.framing {
            Framing::Adts { info } => {
                // Rebuild the 2-byte config from the stream header fields.
                let hdr = crate::extractor::aac::AdtsHeader {
                    object_type: info.object_type.max(2),
                    sample_rate_index: info.sample_rate_index,
                    channel_config: info.channels,
                    frame_length: ADTS_HEADER_LEN,
                    crc_present: false,
                };
                adts_to_asc(&hdr).to_vec()
            }
            Framing::M4a { info, .. } => info.asc.data.clone(),
        }
    }

    fn make_dsp(&self) -> Result<Box<dyn Decoder>, IoError> {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_AAC);
        let (rate, channels) = match &self.framing {
            Framing::Adts { info } => (info.sample_rate, info.channels),
            Framing::M4a { info, .. } => (info.asc.sample_rate, info.asc.channels),
        };
        if rate > 0 {
            params.with_sample_rate(rate);
        }
        params.with_channels(match channels {
            1 => Channels::FRONT_LEFT,
            _ => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        });
        params.with_extra_data(self.asc().into_boxed_slice());
        symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                error!(%e, "failed to create aac dsp");
                IoError::Fail
            })
    }

    /// Read the next raw AAC frame into `pending`, returning its length.
    fn read_frame(&mut self, io: &mut ElementIo) -> Result<usize, IoError> {
        match &mut self.framing {
            Framing::Adts { .. } => {
                fill_pending(io, &mut self.pending, ADTS_HEADER_LEN)?;
                let hdr = parse_adts_header(&self.pending).map_err(|e| {
                    warn!(?e, "lost adts sync");
                    IoError::Fail
                })?;
                fill_pending(io, &mut self.pending, hdr.frame_length)?;
                let skip = ADTS_HEADER_LEN + if hdr.crc_present { 2 } else { 0 };
                self.pending.drain(..skip);
                Ok(hdr.frame_length - skip)
            }
            Framing::M4a { info, cursor, .. } => {
                let Some(&size) = info.stsz.get(*cursor as usize) else {
                    return Err(IoError::Done);
                };
                fill_pending(io, &mut self.pending, size as usize)?;
                *cursor += 1;
                Ok(size as usize)
            }
        }
    }
}

impl FrameDecoder for AacDecoder {
    fn open(&mut self) -> Result<(), IoError> {
        if self.dsp.is_none() {
            self.dsp = Some(self.make_dsp()?);
        }
        Ok(())
    }

    fn decode_frame(&mut self, io: &mut ElementIo, out: &mut Vec<u8>) -> Result<FrameOutcome, IoError> {
        if self.eof {
            return Err(IoError::Done);
        }
        let frame_len = match self.read_frame(io) {
            Ok(n) => n,
            Err(IoError::Done) | Err(IoError::Abort) => {
                self.eof = true;
                return Err(IoError::Done);
            }
            Err(e) => return Err(e),
        };

        let dsp = self.dsp.as_mut().ok_or(IoError::Fail)?;
        let packet = Packet::new_from_slice(0, 0, 0, &self.pending[..frame_len]);
        let decoded = dsp.decode(&packet);
        self.pending.drain(..frame_len);
        match decoded {
            Ok(buffer) => {
                self.fail_streak = 0;
                if self.stream_info.is_none() {
                    let spec = *buffer.spec();
                    self.stream_info = Some(StreamInfo {
                        sample_rate: spec.rate,
                        channels: spec.channels.count() as u8,
                        bits: 16,
                    });
                }
                self.copier.append(buffer, out);
                Ok(FrameOutcome::Pcm)
            }
            Err(e) => {
                self.fail_streak += 1;
                if self.fail_streak >= MAX_DECODE_FAILURES {
                    error!(%e, streak = self.fail_streak, "aac dsp failing persistently");
                    return Err(IoError::Fail);
                }
                warn!(%e, streak = self.fail_streak, "aac frame dropped");
                Ok(FrameOutcome::Skip)
            }
        }
    }

    fn stream_info(&self) -> Option<StreamInfo> {
        self.stream_info
    }

    fn seek(&mut self, offset: u64) -> Result<(), IoError> {
        if let Framing::M4a {
            info,
            content_pos,
            cursor,
        } = &mut self.framing
        {
            // The seek offset is absolute; it always lands on a chunk boundary,
            // so the matching stco entry gives the new sample cursor.
            let target = offset.max(*content_pos);
            match info
                .stco
                .iter()
                .find(|c| c.chunk_offset as u64 == target)
            {
                Some(entry) => {
                    debug!(offset, sample = entry.sample_index, "m4a cursor repositioned");
                    *cursor = entry.sample_index;
                }
                None => {
                    error!(offset, "seek offset is not a chunk boundary");
                    return Err(IoError::Fail);
                }
            }
        }
        self.dsp = Some(self.make_dsp()?);
        self.copier.reset();
        self.pending.clear();
        self.fail_streak = 0;
        self.eof = false;
        Ok(())
    }

    fn close(&mut self) {
        self.dsp = None;
        self.copier.reset();
        self.pending.clear();
        self.fail_streak = 0;
        self.eof = false;
        self.stream_info = None;
    }
}
