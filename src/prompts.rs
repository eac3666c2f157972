//! Prebuilt prompt tones.
//!
//! The tones themselves are small audio blobs supplied by the embedder (they
//! ship with the device firmware); the runtime only fixes their URLs and routes
//! them through the in-memory source.

use std::sync::Arc;

use crate::source::memory::MemorySource;

pub const PREBUILT_SCHEME: &str = "prebuilt";

pub const WAKEUP_REMIND: &str = "prebuilt://wakeup_remind";
pub const RECORD_REMIND: &str = "prebuilt://record_remind";
pub const NETWORK_DISCONNECTED: &str = "prebuilt://network_disconnected";
pub const SERVER_DISCONNECTED: &str = "prebuilt://server_disconnected";
pub const ACCOUNT_UNAUTHORIZED: &str = "prebuilt://account_unauthorized";

/// Blobs for the built-in prompt URLs. Unset entries simply fail to open,
/// which the player reports as a stream error without affecting the dialog.
#[derive(Default, Clone)]
pub struct PromptBlobs {
    pub wakeup_remind: Option<Arc<[u8]>>,
    pub record_remind: Option<Arc<[u8]>>,
    pub network_disconnected: Option<Arc<[u8]>>,
    pub server_disconnected: Option<Arc<[u8]>>,
    pub account_unauthorized: Option<Arc<[u8]>>,
}

impl PromptBlobs {
    pub fn register_into(&self, source: &MemorySource) {
        let entries = [
            (WAKEUP_REMIND, &self.wakeup_remind),
            (RECORD_REMIND, &self.record_remind),
            (NETWORK_DISCONNECTED, &self.network_disconnected),
            (SERVER_DISCONNECTED, &self.server_disconnected),
            (ACCOUNT_UNAUTHORIZED, &self.account_unauthorized),
        ];
        for (url, blob) in entries {
            if let Some(blob) = blob {
                source.register(url, blob.clone());
            }
        }
    }
}
