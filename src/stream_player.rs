//! Logical stream players.
//!
//! The arbiter sees four streams (TTS, prompt, music, wakeup prompt), each
//! backed by one player instance behind the [`StreamControl`] interface. This
//! module maps raw player states onto the coarser stream states the arbiter
//! consumes: `Inited` and `SeekCompleted` are internal and suppressed, and
//! `Stopped` only surfaces after a completion or error was seen (explicit
//! stops are the arbiter's own doing and not echoed back).

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::player::{Player, PlayerState};
use crate::prompts;
use crate::sink::SinkAdapter;
use crate::source::memory::MemorySource;
use crate::tts_player::TtsPlayer;
use crate::{Error, Result};

pub const TTS_RINGBUF_SIZE: usize = 32 * 1024;
pub const PROMPT_RINGBUF_SIZE: usize = 32 * 1024;
pub const MUSIC_RINGBUF_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Tts,
    Prompt,
    Music,
    PromptWakeup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Prepared,
    Started,
    Paused,
    /// Synthesized by the arbiter when ducked music restarts.
    Resumed,
    NearlyCompleted,
    Completed,
    Stopped,
    Error,
}

pub type StreamStateListener = Arc<dyn Fn(StreamKind, StreamState) + Send + Sync>;

/// Player surface the arbiter drives, one instance per logical stream.
pub trait StreamControl: Send + Sync {
    fn kind(&self) -> StreamKind;
    fn set_state_listener(&self, listener: StreamStateListener) -> Result<()>;
    fn set_data_source(&self, url: &str) -> Result<()>;
    fn prepare_async(&self) -> Result<()>;
    /// TTS only: push a synthesized frame.
    fn write(&self, data: &[u8], final_frame: bool) -> Result<()>;
    fn start(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn position_ms(&self) -> Option<u32>;
    fn duration_ms(&self) -> Option<u32>;
}

pub trait StreamFactory: Send + Sync {
    fn create(&self, kind: StreamKind) -> Result<Arc<dyn StreamControl>>;
}

/// Map a player state to the stream state visible above, tracking the
/// completed/error latch.
fn map_state(state: PlayerState, has_completed: &mut bool) -> Option<StreamState> {
    match state {
        PlayerState::Idle => {
            *has_completed = false;
            Some(StreamState::Idle)
        }
        PlayerState::Inited | PlayerState::SeekCompleted => None,
        PlayerState::Prepared => Some(StreamState::Prepared),
        PlayerState::Started => Some(StreamState::Started),
        PlayerState::Paused => Some(StreamState::Paused),
        PlayerState::NearlyCompleted => Some(StreamState::NearlyCompleted),
        PlayerState::Completed => {
            *has_completed = true;
            Some(StreamState::Completed)
        }
        PlayerState::Stopped => {
            if *has_completed {
                Some(StreamState::Stopped)
            } else {
                None
            }
        }
        PlayerState::Error => {
            *has_completed = true;
            Some(StreamState::Error)
        }
    }
}

enum Backend {
    Url(Player),
    Tts(TtsPlayer),
}

/// The default stream player: a url player (file/http/prebuilt) or a TTS
/// player, with the upper-state mapping applied.
pub struct VendorStream {
    kind: StreamKind,
    backend: Backend,
}

impl VendorStream {
    fn install_listener(&self, listener: StreamStateListener) -> Result<()> {
        let kind = self.kind;
        let latch = Arc::new(Mutex::new(false));
        let mapped: crate::player::PlayerStateListener = Arc::new(move |state, errcode| {
            let mut has_completed = latch.lock().unwrap();
            if let Some(upper) = map_state(state, &mut has_completed) {
                if upper == StreamState::Error {
                    debug!(?kind, errcode, "stream error");
                }
                listener(kind, upper);
            }
        });
        match &self.backend {
            Backend::Url(p) => p.set_state_listener(mapped),
            Backend::Tts(p) => p.set_state_listener(mapped),
        }
    }
}

impl StreamControl for VendorStream {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn set_state_listener(&self, listener: StreamStateListener) -> Result<()> {
        self.install_listener(listener)
    }

    fn set_data_source(&self, url: &str) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.set_data_source(url),
            Backend::Tts(_) => Err(Error::InvalidState("set_data_source on tts stream")),
        }
    }

    fn prepare_async(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.prepare_async(),
            Backend::Tts(p) => p.prepare_async(),
        }
    }

    fn write(&self, data: &[u8], final_frame: bool) -> Result<()> {
        match &self.backend {
            Backend::Tts(p) => p.write(data, final_frame),
            Backend::Url(_) => Err(Error::InvalidState("write on url stream")),
        }
    }

    fn start(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.start(),
            Backend::Tts(p) => p.start(),
        }
    }

    fn pause(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.pause(),
            Backend::Tts(_) => Err(Error::InvalidState("pause on tts stream")),
        }
    }

    fn resume(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.resume(),
            Backend::Tts(_) => Err(Error::InvalidState("resume on tts stream")),
        }
    }

    fn stop(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.stop(),
            Backend::Tts(p) => p.stop(),
        }
    }

    fn reset(&self) -> Result<()> {
        match &self.backend {
            Backend::Url(p) => p.reset(),
            Backend::Tts(p) => p.reset(),
        }
    }

    fn position_ms(&self) -> Option<u32> {
        match &self.backend {
            Backend::Url(p) => Some(p.position_ms()),
            Backend::Tts(_) => None,
        }
    }

    fn duration_ms(&self) -> Option<u32> {
        match &self.backend {
            Backend::Url(p) => p.duration_ms().ok(),
            Backend::Tts(_) => None,
        }
    }
}

/// Factory wiring each stream to the PCM sink and its source adapters.
pub struct VendorStreamFactory {
    sink: Arc<dyn SinkAdapter>,
    prompts: Arc<MemorySource>,
}

impl VendorStreamFactory {
    pub fn new(sink: Arc<dyn SinkAdapter>) -> Self {
        Self {
            sink,
            prompts: Arc::new(MemorySource::new(prompts::PREBUILT_SCHEME)),
        }
    }

    /// The shared registry of compiled-in prompt tones.
    pub fn prompts(&self) -> &Arc<MemorySource> {
        &self.prompts
    }
}

impl StreamFactory for VendorStreamFactory {
    fn create(&self, kind: StreamKind) -> Result<Arc<dyn StreamControl>> {
        let backend = match kind {
            StreamKind::Tts => {
                let tts = TtsPlayer::new(TTS_RINGBUF_SIZE)?;
                tts.register_sink(self.sink.clone())?;
                Backend::Tts(tts)
            }
            _ => {
                let player = Player::new();
                player.register_sink(self.sink.clone())?;
                player.register_source(self.prompts.clone())?;
                #[cfg(feature = "http")]
                {
                    let ringbuf = if kind == StreamKind::Music {
                        MUSIC_RINGBUF_SIZE
                    } else {
                        PROMPT_RINGBUF_SIZE
                    };
                    player.register_source(Arc::new(crate::source::http::HttpSource::new(
                        ringbuf,
                    )?))?;
                }
                Backend::Url(player)
            }
        };
        Ok(Arc::new(VendorStream { kind, backend }))
    }
}
