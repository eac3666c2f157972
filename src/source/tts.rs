//! One-shot TTS stream source.
//!
//! The cloud pushes synthesized audio frames through [`TtsFeed::write`]; the
//! decoder pulls them back out through this adapter. Before the player has
//! prepared, reads are capped to the probe-header size and must be satisfiable
//! immediately; afterwards reads block on the ringbuf like any live stream.
//! Seeking is forward-only (discard), since pushed bytes cannot be replayed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use super::{SourceAdapter, SourceHandle};
use crate::ringbuf::{Ringbuf, RingbufError};
use crate::{Error, Result};

/// Probe window the parser may consume before playback starts.
pub const TTS_HEADER_SIZE: usize = 2048;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state between the TTS writer (cloud side) and the source adapter
/// (decoder side).
pub struct TtsFeed {
    ringbuf: Arc<Ringbuf>,
    offset: AtomicU64,
    has_prepared: AtomicBool,
    force_stop: AtomicBool,
    waiting_data: AtomicBool,
}

impl TtsFeed {
    pub fn new(ringbuf_size: usize) -> Self {
        Self {
            ringbuf: Arc::new(Ringbuf::new(ringbuf_size)),
            offset: AtomicU64::new(0),
            has_prepared: AtomicBool::new(false),
            force_stop: AtomicBool::new(false),
            waiting_data: AtomicBool::new(false),
        }
    }

    pub fn ringbuf(&self) -> &Arc<Ringbuf> {
        &self.ringbuf
    }

    /// Arm the feed for a fresh utterance.
    pub fn begin(&self) {
        self.ringbuf.reset();
        self.offset.store(0, Ordering::SeqCst);
        self.has_prepared.store(false, Ordering::SeqCst);
        self.force_stop.store(false, Ordering::SeqCst);
        self.waiting_data.store(true, Ordering::SeqCst);
    }

    pub fn mark_prepared(&self) {
        self.has_prepared.store(true, Ordering::SeqCst);
    }

    pub fn has_prepared(&self) -> bool {
        self.has_prepared.load(Ordering::SeqCst)
    }

    pub fn buffered(&self) -> usize {
        self.ringbuf.bytes_filled()
    }

    /// Stop accepting writes and release any blocked reader.
    pub fn shutdown(&self) {
        self.force_stop.store(true, Ordering::SeqCst);
        self.waiting_data.store(false, Ordering::SeqCst);
        self.ringbuf.done_write();
    }

    /// Push one synthesized frame. `final_frame` closes the stream.
    pub fn write(&self, data: &[u8], final_frame: bool) -> Result<()> {
        if !self.waiting_data.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("tts write before prepare"));
        }
        let mut written = 0usize;
        while !self.force_stop.load(Ordering::SeqCst) && written < data.len() {
            match self.ringbuf.write(&data[written..], Some(WRITE_TIMEOUT)) {
                Ok(n) => written += n,
                Err(RingbufError::Timeout) => {
                    warn!("timeout writing tts frame, retrying");
                    continue;
                }
                Err(RingbufError::Done) => break,
                Err(e) => {
                    return Err(Error::msg(format!("tts ringbuf write failed: {e:?}")));
                }
            }
        }
        if final_frame || self.force_stop.load(Ordering::SeqCst) {
            self.ringbuf.done_write();
        }
        Ok(())
    }
}

pub struct TtsSource {
    feed: Arc<TtsFeed>,
}

impl TtsSource {
    pub fn new(feed: Arc<TtsFeed>) -> Self {
        Self { feed }
    }
}

struct TtsHandle {
    feed: Arc<TtsFeed>,
}

impl TtsHandle {
    fn discard_to(&self, offset: u64) -> Result<()> {
        let current = self.feed.offset.load(Ordering::SeqCst);
        if offset < current {
            return Err(Error::msg("tts source cannot seek backward"));
        }
        let mut remain = (offset - current) as usize;
        if !self.feed.has_prepared() && remain > self.feed.buffered() {
            return Err(Error::msg("insufficient buffered tts data to seek"));
        }
        let mut scratch = [0u8; 1024];
        while remain > 0 {
            let want = remain.min(scratch.len());
            match self.feed.ringbuf.read(&mut scratch[..want], None) {
                Ok(n) => {
                    remain -= n;
                    self.feed.offset.fetch_add(n as u64, Ordering::SeqCst);
                }
                Err(e) => return Err(Error::msg(format!("tts seek drain failed: {e:?}"))),
            }
        }
        Ok(())
    }
}

impl SourceAdapter for TtsSource {
    fn url_protocol(&self) -> &str {
        "tts"
    }

    fn buffer_size(&self) -> usize {
        TTS_HEADER_SIZE
    }

    fn open(&self, url: &str, offset: u64) -> Result<Box<dyn SourceHandle>> {
        debug!(url, offset, "opening tts source");
        let handle = TtsHandle {
            feed: self.feed.clone(),
        };
        if offset != self.feed.offset.load(Ordering::SeqCst) {
            handle.discard_to(offset)?;
        }
        Ok(Box::new(handle))
    }
}

impl SourceHandle for TtsHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut len = buf.len();
        if !self.feed.has_prepared() {
            len = len.min(TTS_HEADER_SIZE);
            if len > self.feed.buffered() {
                return Err(Error::msg(
                    "insufficient tts data to probe; feed more before preparing",
                ));
            }
        }
        match self.feed.ringbuf.read(&mut buf[..len], None) {
            Ok(n) => {
                self.feed.offset.fetch_add(n as u64, Ordering::SeqCst);
                Ok(n)
            }
            Err(RingbufError::Done) => Ok(0),
            Err(e) => Err(Error::msg(format!("tts read failed: {e:?}"))),
        }
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.discard_to(offset)
    }

    fn content_pos(&self) -> u64 {
        self.feed.offset.load(Ordering::SeqCst)
    }

    fn content_len(&self) -> u64 {
        0
    }
}
