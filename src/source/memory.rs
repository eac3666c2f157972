//! In-memory blob source.
//!
//! Serves the compiled-in prompt tones (`prebuilt://...`) and any other
//! embedder-registered blob (`static://...`). Blobs are registered once by name
//! and shared read-only between concurrent playbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::{SourceAdapter, SourceHandle};
use crate::{Error, Result};

pub struct MemorySource {
    scheme: &'static str,
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
}

struct MemoryHandle {
    blob: Arc<[u8]>,
    offset: u64,
}

impl MemorySource {
    pub fn new(scheme: &'static str) -> Self {
        Self {
            scheme,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a blob under its full URL (e.g. `prebuilt://wakeup_remind`).
    pub fn register(&self, url: &str, data: impl Into<Arc<[u8]>>) {
        self.blobs.lock().unwrap().insert(url.to_string(), data.into());
    }
}

impl SourceAdapter for MemorySource {
    fn url_protocol(&self) -> &str {
        self.scheme
    }

    fn open(&self, url: &str, offset: u64) -> Result<Box<dyn SourceHandle>> {
        let blob = self
            .blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| {
                warn!(url, "no blob registered for url");
                Error::AdapterUnavailable(format!("unknown memory blob {url}"))
            })?;
        if offset > blob.len() as u64 {
            return Err(Error::msg("open offset beyond blob length"));
        }
        Ok(Box::new(MemoryHandle { blob, offset }))
    }
}

impl SourceHandle for MemoryHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remain = self.blob.len() as u64 - self.offset;
        let n = (buf.len() as u64).min(remain) as usize;
        if n > 0 {
            let at = self.offset as usize;
            buf[..n].copy_from_slice(&self.blob[at..at + n]);
            self.offset += n as u64;
        }
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if offset > self.blob.len() as u64 {
            return Err(Error::msg("seek beyond blob length"));
        }
        self.offset = offset;
        Ok(())
    }

    fn content_pos(&self) -> u64 {
        self.offset
    }

    fn content_len(&self) -> u64 {
        self.blob.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_registered_blob() -> anyhow::Result<()> {
        let src = MemorySource::new("prebuilt");
        src.register("prebuilt://tone", vec![1u8, 2, 3, 4, 5]);
        let mut handle = src.open("prebuilt://tone", 1)?;
        assert_eq!(handle.content_len(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf)?, 4);
        assert_eq!(&buf[..4], &[2, 3, 4, 5]);
        assert_eq!(handle.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn unknown_blob_is_an_error() {
        let src = MemorySource::new("prebuilt");
        assert!(src.open("prebuilt://nope", 0).is_err());
    }

    #[test]
    fn open_past_end_is_rejected() {
        let src = MemorySource::new("prebuilt");
        src.register("prebuilt://tone", vec![0u8; 4]);
        assert!(src.open("prebuilt://tone", 5).is_err());
    }
}
