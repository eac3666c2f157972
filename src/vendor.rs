//! Vendor hardware adapter.
//!
//! Everything the runtime needs from the device: business keys for the cloud
//! handshake, PCM capture and playback, and the (optional) speaker mixer.
//! Each operation the original exposed as a nullable function pointer is an
//! optional trait object here.

use std::sync::Arc;

use crate::Result;
use crate::sink::SinkAdapter;

/// Device identity and credentials. `uuid`/`access_token` are `None` until the
/// device has been authorized.
#[derive(Debug, Clone, Default)]
pub struct DeviceKeys {
    pub biz_type: Option<String>,
    pub biz_group: Option<String>,
    pub biz_secret: Option<String>,
    pub ca_cert: Option<String>,
    pub mac_addr: String,
    pub uuid: Option<String>,
    pub access_token: Option<String>,
}

/// Microphone capture: open a device for a format, then pull frames.
pub trait CaptureAdapter: Send + Sync {
    fn open(&self, sample_rate: u32, channels: u8, bits: u8) -> Result<Box<dyn CaptureDevice>>;
}

pub trait CaptureDevice: Send {
    /// Read up to `buf.len()` captured bytes; `Ok(0)` when no data is ready.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Speaker mixer controls.
pub trait SpeakerMixer: Send + Sync {
    fn set_volume(&self, volume: i32) -> Result<()>;
    fn volume(&self) -> Result<i32>;
    fn set_muted(&self, muted: bool) -> Result<()>;
    fn muted(&self) -> Result<bool>;
}

pub trait VendorAdapter: Send + Sync {
    fn device_keys(&self) -> DeviceKeys;
    fn pcm_output(&self) -> Arc<dyn SinkAdapter>;
    fn pcm_input(&self) -> Arc<dyn CaptureAdapter>;
    /// `None` when the device has no software mixer.
    fn mixer(&self) -> Option<Arc<dyn SpeakerMixer>> {
        None
    }
}
