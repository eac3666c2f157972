//! Media source adapters.
//!
//! One adapter per URL scheme. An adapter opens URLs into [`SourceHandle`]s;
//! handles are uniquely owned by whichever component is currently reading (the
//! media parser, then the feeder or the sync reader) and close on drop.
//!
//! Adapters declare whether they are asynchronous (fed through a producer
//! thread and a ringbuf, e.g. HTTP) and a recommended buffer size, which the
//! registry clamps to [32 KiB, 1 MiB] in async mode and [2 KiB, 16 KiB] in sync
//! mode.

pub mod file;
#[cfg(feature = "http")]
pub mod http;
pub mod memory;
pub mod tts;

use std::sync::{Arc, Mutex};

use crate::{Error, Result};

pub const MIN_ASYNC_BUFFER: usize = 32 * 1024;
pub const MAX_ASYNC_BUFFER: usize = 1024 * 1024;
pub const MIN_SYNC_BUFFER: usize = 2 * 1024;
pub const MAX_SYNC_BUFFER: usize = 16 * 1024;

/// An open, readable media stream.
///
/// `content_pos` must be exact: the media parser's handle-reuse protocol
/// depends on the adapter not caching reads beyond the reported position.
pub trait SourceHandle: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Reposition to an absolute offset.
    fn seek(&mut self, offset: u64) -> Result<()>;
    fn content_pos(&self) -> u64;
    /// Total length, 0 when unknown.
    fn content_len(&self) -> u64;
}

pub trait SourceAdapter: Send + Sync {
    /// URL scheme this adapter serves (`file`, `http`, `tts`, `prebuilt`, ...).
    fn url_protocol(&self) -> &str;
    /// True when reads may block on a network and need a producer thread.
    fn async_mode(&self) -> bool {
        false
    }
    /// Recommended ringbuf/reservoir size; clamped by the registry.
    fn buffer_size(&self) -> usize {
        MIN_SYNC_BUFFER
    }
    fn open(&self, url: &str, offset: u64) -> Result<Box<dyn SourceHandle>>;
}

/// A registered adapter with its clamped buffer size.
#[derive(Clone)]
pub struct RegisteredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub buffer_size: usize,
}

impl RegisteredSource {
    fn new(adapter: Arc<dyn SourceAdapter>) -> Self {
        let raw = adapter.buffer_size() / 1024 * 1024;
        let buffer_size = if adapter.async_mode() {
            raw.clamp(MIN_ASYNC_BUFFER, MAX_ASYNC_BUFFER)
        } else {
            raw.clamp(MIN_SYNC_BUFFER, MAX_SYNC_BUFFER)
        };
        Self { adapter, buffer_size }
    }
}

/// Scheme-keyed adapter registry with a `file` fallback for bare paths.
pub struct SourceRegistry {
    sources: Mutex<Vec<RegisteredSource>>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        let registry = Self {
            sources: Mutex::new(Vec::new()),
        };
        registry.register(Arc::new(file::FileSource));
        registry
    }

    /// Register or replace the adapter for a scheme.
    pub fn register(&self, adapter: Arc<dyn SourceAdapter>) {
        let entry = RegisteredSource::new(adapter);
        let mut sources = self.sources.lock().unwrap();
        if let Some(existing) = sources
            .iter_mut()
            .find(|s| s.adapter.url_protocol().eq_ignore_ascii_case(entry.adapter.url_protocol()))
        {
            *existing = entry;
        } else {
            sources.push(entry);
        }
    }

    /// Find the adapter whose scheme prefixes `url`, falling back to `file`.
    pub fn find(&self, url: &str) -> Result<RegisteredSource> {
        let sources = self.sources.lock().unwrap();
        for s in sources.iter() {
            let proto = s.adapter.url_protocol();
            if url.len() >= proto.len() && url[..proto.len()].eq_ignore_ascii_case(proto) {
                return Ok(s.clone());
            }
        }
        sources
            .iter()
            .find(|s| s.adapter.url_protocol() == "file")
            .cloned()
            .ok_or_else(|| Error::AdapterUnavailable(format!("no source adapter for {url}")))
    }
}
