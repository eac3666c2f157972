//! PCM sink adapter.
//!
//! The playback side of the vendor audio I/O: open a device for a given
//! format, write interleaved PCM, close. Format changes mid-stream are handled
//! by the player closing and reopening the sink.

use std::sync::{Arc, Mutex};

use crate::Result;

pub trait SinkDevice: Send {
    fn write(&mut self, pcm: &[u8]) -> Result<usize>;
}

pub trait SinkAdapter: Send + Sync {
    fn name(&self) -> &str {
        "default"
    }
    fn open(&self, sample_rate: u32, channels: u8, bits: u8) -> Result<Box<dyn SinkDevice>>;
}

/// Test sink that accumulates written PCM and records open parameters.
pub struct CollectSink {
    state: Arc<Mutex<CollectState>>,
}

#[derive(Default)]
pub struct CollectState {
    pub opens: Vec<(u32, u8, u8)>,
    pub data: Vec<u8>,
}

struct CollectDevice {
    state: Arc<Mutex<CollectState>>,
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectState::default())),
        }
    }

    pub fn state(&self) -> Arc<Mutex<CollectState>> {
        self.state.clone()
    }
}

impl SinkAdapter for CollectSink {
    fn name(&self) -> &str {
        "collect"
    }

    fn open(&self, sample_rate: u32, channels: u8, bits: u8) -> Result<Box<dyn SinkDevice>> {
        self.state
            .lock()
            .unwrap()
            .opens
            .push((sample_rate, channels, bits));
        Ok(Box::new(CollectDevice {
            state: self.state.clone(),
        }))
    }
}

impl SinkDevice for CollectDevice {
    fn write(&mut self, pcm: &[u8]) -> Result<usize> {
        self.state.lock().unwrap().data.extend_from_slice(pcm);
        Ok(pcm.len())
    }
}
