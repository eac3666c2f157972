//! Byte movers between a source handle and the decoder.
//!
//! Two modes, chosen by the adapter:
//! - **Async** ([`Feeder`]): a producer thread pulls from the source and pushes
//!   into the session ringbuf. Used for network sources, including m3u
//!   playlists (entries play back to back; a drained playlist is re-resolved).
//! - **Sync** ([`SyncReader`]): the decoder's read callback pulls straight from
//!   the source, with the session ringbuf acting as a small reservoir so tiny
//!   decoder reads don't thrash the source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::element::{IoError, IoResult, SourceReader};
use crate::m3u;
use crate::ringbuf::{Ringbuf, RingbufError};
use crate::source::{SourceAdapter, SourceHandle};

const FEED_CHUNK_SIZE: usize = 8 * 1024;
const M3U_FILL_THRESHOLD: usize = 32 * 1024;
const M3U_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederEvent {
    ReadFailed,
    /// Source exhausted; everything is buffered. The player reports
    /// nearly-completed on this.
    ReadDone,
    WriteFailed,
    WriteDone,
}

pub type FeederCallback = Arc<dyn Fn(FeederEvent) + Send + Sync>;

/// Async producer: owns the source handle for the life of the stream.
pub struct Feeder {
    stop: Arc<AtomicBool>,
    ringbuf: Arc<Ringbuf>,
}

pub struct FeederConfig {
    pub url: String,
    pub adapter: Arc<dyn SourceAdapter>,
    pub ringbuf: Arc<Ringbuf>,
    /// Absolute offset to open at (frame start + seek offset).
    pub content_pos: u64,
    /// Already-open handle carried over from the parser, if any.
    pub handle: Option<Box<dyn SourceHandle>>,
    pub listener: FeederCallback,
}

impl Feeder {
    pub fn start(cfg: FeederConfig) -> crate::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let ringbuf = cfg.ringbuf.clone();
        let thread_stop = stop.clone();
        let playlist = m3u::is_m3u(&cfg.url);

        // A fresh stream starts with an empty buffer; a reused handle may have
        // parser tail bytes stuffed in already.
        if playlist || cfg.handle.is_none() {
            cfg.ringbuf.reset();
        }

        let builder = thread::Builder::new().name("ael-source".into());
        builder
            .spawn(move || {
                if playlist {
                    playlist_loop(cfg, thread_stop);
                } else {
                    stream_loop(cfg, thread_stop);
                }
            })
            .map_err(|e| crate::Error::msg(format!("failed to spawn feeder: {e}")))?;

        Ok(Self { stop, ringbuf })
    }

    /// Signal the producer to exit and unblock anything parked on the ringbuf.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ringbuf.done_write();
        self.ringbuf.abort();
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Push `buf` into the ringbuf, honoring the stop flag.
fn pump(
    ringbuf: &Ringbuf,
    stop: &AtomicBool,
    buf: &[u8],
) -> std::result::Result<(), FeederEvent> {
    let mut written = 0usize;
    while written < buf.len() {
        if stop.load(Ordering::SeqCst) {
            return Err(FeederEvent::WriteDone);
        }
        match ringbuf.write(&buf[written..], Some(Duration::from_millis(200))) {
            Ok(n) => written += n,
            Err(RingbufError::Timeout) => continue,
            Err(RingbufError::Done) | Err(RingbufError::Abort) => {
                return Err(FeederEvent::WriteDone);
            }
            Err(_) => return Err(FeederEvent::WriteFailed),
        }
    }
    Ok(())
}

fn finish(cfg: &FeederConfig, stop: &AtomicBool, event: FeederEvent) {
    if stop.load(Ordering::SeqCst) {
        return;
    }
    match event {
        FeederEvent::ReadDone | FeederEvent::WriteDone => cfg.ringbuf.done_write(),
        _ => cfg.ringbuf.abort(),
    }
    (cfg.listener)(event);
}

fn stream_loop(mut cfg: FeederConfig, stop: Arc<AtomicBool>) {
    let mut handle = match cfg.handle.take() {
        Some(h) => h,
        None => match cfg.adapter.open(&cfg.url, cfg.content_pos) {
            Ok(h) => h,
            Err(e) => {
                error!(url = %cfg.url, %e, "feeder failed to open source");
                finish(&cfg, &stop, FeederEvent::ReadFailed);
                return;
            }
        },
    };

    let mut buf = vec![0u8; FEED_CHUNK_SIZE];
    let event = loop {
        if stop.load(Ordering::SeqCst) {
            debug!("feeder stopping");
            break FeederEvent::WriteDone;
        }
        match handle.read(&mut buf) {
            Ok(0) => {
                debug!("feeder source read done");
                break FeederEvent::ReadDone;
            }
            Ok(n) => {
                if let Err(ev) = pump(&cfg.ringbuf, &stop, &buf[..n]) {
                    break ev;
                }
            }
            Err(e) => {
                error!(%e, "feeder source read failed");
                break FeederEvent::ReadFailed;
            }
        }
    };
    finish(&cfg, &stop, event);
    debug!("media source task leaving");
}

fn playlist_loop(cfg: FeederConfig, stop: Arc<AtomicBool>) {
    let mut queue: Vec<String> = Vec::new();
    let mut buf = vec![0u8; FEED_CHUNK_SIZE];
    let mut first_entry = true;

    let event = 'outer: loop {
        if stop.load(Ordering::SeqCst) {
            break FeederEvent::WriteDone;
        }

        if queue.is_empty() {
            // Let the decoder drain old data before re-resolving a live list.
            while !stop.load(Ordering::SeqCst)
                && cfg.ringbuf.bytes_filled() > M3U_FILL_THRESHOLD
            {
                thread::sleep(M3U_BACKOFF);
            }
            match m3u::fetch_playlist(&cfg.adapter, &cfg.url) {
                Ok(entries) if !entries.is_empty() => queue = entries,
                Ok(_) | Err(_) => {
                    warn!(url = %cfg.url, "failed to resolve playlist");
                    break FeederEvent::ReadFailed;
                }
            }
        }

        let entry = queue.remove(0);
        // Resuming mid-entry only applies to the first URL after a seek.
        let pos = if first_entry { cfg.content_pos } else { 0 };
        first_entry = false;

        let mut handle = match cfg.adapter.open(&entry, pos) {
            Ok(h) => h,
            Err(e) => {
                warn!(url = %entry, %e, "playlist entry failed to open, trying next");
                continue;
            }
        };

        loop {
            if stop.load(Ordering::SeqCst) {
                break 'outer FeederEvent::WriteDone;
            }
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(ev) = pump(&cfg.ringbuf, &stop, &buf[..n]) {
                        break 'outer ev;
                    }
                }
                Err(e) => {
                    warn!(url = %entry, %e, "playlist entry read failed, trying next");
                    break;
                }
            }
        }
    };
    finish(&cfg, &stop, event);
    debug!("m3u source task leaving");
}

/// Sync-mode input: the decoder reads straight through the source handle, with
/// the session ringbuf as a reservoir for small reads.
pub struct SyncReader {
    adapter: Arc<dyn SourceAdapter>,
    url: String,
    open_offset: u64,
    handle: Option<Box<dyn SourceHandle>>,
    reservoir: Arc<Ringbuf>,
    scratch: Vec<u8>,
}

impl SyncReader {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        url: String,
        open_offset: u64,
        reservoir: Arc<Ringbuf>,
        buffer_size: usize,
        handle: Option<Box<dyn SourceHandle>>,
    ) -> Self {
        Self {
            adapter,
            url,
            open_offset,
            handle,
            reservoir,
            scratch: vec![0u8; buffer_size],
        }
    }
}

impl SourceReader for SyncReader {
    fn open(&mut self) -> Result<(), IoError> {
        if self.handle.is_none() {
            debug!(url = %self.url, offset = self.open_offset, "opening sync source");
            match self.adapter.open(&self.url, self.open_offset) {
                Ok(h) => {
                    self.handle = Some(h);
                    self.reservoir.reset();
                }
                Err(e) => {
                    error!(url = %self.url, %e, "failed to open sync source");
                    return Err(IoError::Fail);
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> IoResult {
        let handle = self.handle.as_mut().ok_or(IoError::Fail)?;

        // Serve buffered bytes first.
        let buffered = self.reservoir.bytes_filled();
        if buffered >= buf.len() {
            return self
                .reservoir
                .read_chunk(buf, Some(Duration::ZERO))
                .map_err(Into::into);
        }
        let mut got = 0usize;
        if buffered > 0 {
            got = self
                .reservoir
                .read_chunk(&mut buf[..buffered], Some(Duration::ZERO))
                .map_err(IoError::from)?;
        }

        let want = buf.len() - got;
        if want < self.scratch.len() / 2 {
            // Small ask: fill the reservoir with a full source read.
            let n = match handle.read(&mut self.scratch) {
                Ok(n) => n,
                Err(e) => {
                    error!(%e, "sync source read failed");
                    return Err(IoError::Fail);
                }
            };
            if n == 0 {
                return if got > 0 { Ok(got) } else { Err(IoError::Done) };
            }
            if n > want {
                buf[got..got + want].copy_from_slice(&self.scratch[..want]);
                let _ = self
                    .reservoir
                    .write_chunk(&self.scratch[want..n], Some(Duration::ZERO));
                Ok(buf.len())
            } else {
                buf[got..got + n].copy_from_slice(&self.scratch[..n]);
                Ok(got + n)
            }
        } else {
            match handle.read(&mut buf[got..]) {
                Ok(0) if got == 0 => Err(IoError::Done),
                Ok(n) => Ok(got + n),
                Err(e) => {
                    error!(%e, "sync source read failed");
                    Err(IoError::Fail)
                }
            }
        }
    }

    fn seek(&mut self, offset: u64) -> Result<(), IoError> {
        self.reservoir.reset();
        match self.handle.as_mut() {
            Some(h) => h.seek(offset).map_err(|e| {
                error!(%e, "sync source seek failed");
                IoError::Fail
            }),
            None => {
                self.open_offset = offset;
                Ok(())
            }
        }
    }

    fn close(&mut self, paused: bool) {
        if !paused && self.handle.is_some() {
            debug!(url = %self.url, "closing sync source");
            self.handle = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use std::sync::Mutex;

    fn memory_adapter(data: Vec<u8>) -> Arc<dyn SourceAdapter> {
        let src = MemorySource::new("static");
        src.register("static://stream", data);
        Arc::new(src)
    }

    #[test]
    fn feeder_moves_all_bytes_and_reports_done() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let adapter = memory_adapter(data.clone());
        let ringbuf = Arc::new(Ringbuf::new(4096));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let _feeder = Feeder::start(FeederConfig {
            url: "static://stream".into(),
            adapter,
            ringbuf: ringbuf.clone(),
            content_pos: 0,
            handle: None,
            listener: Arc::new(move |ev| sink.lock().unwrap().push(ev)),
        })
        .unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 1500];
        loop {
            match ringbuf.read(&mut buf, Some(Duration::from_secs(2))) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(RingbufError::Done) => break,
                Err(e) => panic!("unexpected: {e:?}"),
            }
        }
        assert_eq!(out, data);
        assert_eq!(events.lock().unwrap().as_slice(), &[FeederEvent::ReadDone]);
    }

    #[test]
    fn feeder_honors_content_pos() {
        let data: Vec<u8> = (0..64u8).collect();
        let adapter = memory_adapter(data);
        let ringbuf = Arc::new(Ringbuf::new(256));
        let _feeder = Feeder::start(FeederConfig {
            url: "static://stream".into(),
            adapter,
            ringbuf: ringbuf.clone(),
            content_pos: 60,
            handle: None,
            listener: Arc::new(|_| {}),
        })
        .unwrap();
        let mut buf = [0u8; 16];
        let n = ringbuf.read(&mut buf, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(&buf[..n], &[60, 61, 62, 63]);
    }

    #[test]
    fn feeder_reports_read_failure_on_bad_url() {
        let adapter: Arc<dyn SourceAdapter> = Arc::new(MemorySource::new("static"));
        let ringbuf = Arc::new(Ringbuf::new(256));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _feeder = Feeder::start(FeederConfig {
            url: "static://missing".into(),
            adapter,
            ringbuf: ringbuf.clone(),
            content_pos: 0,
            handle: None,
            listener: Arc::new(move |ev| sink.lock().unwrap().push(ev)),
        })
        .unwrap();
        for _ in 0..100 {
            if !events.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(events.lock().unwrap().as_slice(), &[FeederEvent::ReadFailed]);
    }

    #[test]
    fn stopped_feeder_suppresses_events() {
        let data = vec![0u8; 1024 * 1024];
        let adapter = memory_adapter(data);
        let ringbuf = Arc::new(Ringbuf::new(1024));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let feeder = Feeder::start(FeederConfig {
            url: "static://stream".into(),
            adapter,
            ringbuf: ringbuf.clone(),
            content_pos: 0,
            handle: None,
            listener: Arc::new(move |ev| sink.lock().unwrap().push(ev)),
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        feeder.stop();
        thread::sleep(Duration::from_millis(50));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn sync_reader_small_reads_use_reservoir() {
        let data: Vec<u8> = (0..200u8).collect();
        let adapter = memory_adapter(data.clone());
        let reservoir = Arc::new(Ringbuf::new(256));
        let mut reader = SyncReader::new(
            adapter,
            "static://stream".into(),
            0,
            reservoir.clone(),
            128,
            None,
        );
        reader.open().unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.read(&mut buf, None) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(IoError::Done) => break,
                Err(e) => panic!("unexpected: {e:?}"),
            }
        }
        assert_eq!(out, data);
        // A full source chunk was parked in the reservoir at some point.
        assert!(reservoir.capacity() >= 128);
    }

    #[test]
    fn sync_reader_seek_repositions() {
        let data: Vec<u8> = (0..100u8).collect();
        let adapter = memory_adapter(data);
        let reservoir = Arc::new(Ringbuf::new(256));
        let mut reader = SyncReader::new(
            adapter,
            "static://stream".into(),
            0,
            reservoir,
            64,
            None,
        );
        reader.open().unwrap();
        let mut buf = [0u8; 10];
        reader.read(&mut buf, None).unwrap();
        reader.seek(50).unwrap();
        let n = reader.read(&mut buf, None).unwrap();
        assert_eq!(buf[..n][0], 50);
    }
}
