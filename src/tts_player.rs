//! Write-interface player for streamed TTS.
//!
//! The cloud pushes synthesized frames into the feed; once a probe window is
//! buffered (or the stream ends early) the wrapped player is prepared against
//! the `tts` source and plays as the remaining frames arrive.

use std::sync::Arc;

use tracing::debug;

use crate::player::{Player, PlayerStateListener};
use crate::sink::SinkAdapter;
use crate::source::tts::{TTS_HEADER_SIZE, TtsFeed, TtsSource};
use crate::Result;

const TTS_URL: &str = "tts.rawdata";
const MIN_RINGBUF_SIZE: usize = 16 * 1024;

pub struct TtsPlayer {
    player: Player,
    feed: Arc<TtsFeed>,
}

impl TtsPlayer {
    pub fn new(ringbuf_size: usize) -> Result<Self> {
        let feed = Arc::new(TtsFeed::new(ringbuf_size.max(MIN_RINGBUF_SIZE)));
        let player = Player::new();
        player.register_source(Arc::new(TtsSource::new(feed.clone())))?;
        Ok(Self { player, feed })
    }

    pub fn register_sink(&self, sink: Arc<dyn SinkAdapter>) -> Result<()> {
        self.player.register_sink(sink)
    }

    pub fn set_state_listener(&self, listener: PlayerStateListener) -> Result<()> {
        self.player.set_state_listener(listener)
    }

    /// Arm the feed and bind the player to the TTS source. The actual probe is
    /// deferred until enough audio has been written.
    pub fn prepare_async(&self) -> Result<()> {
        self.feed.begin();
        self.player.set_data_source(TTS_URL)
    }

    /// Push one synthesized frame; `final_frame` ends the utterance.
    ///
    /// The player prepares itself once the probe window is full (or on the
    /// final frame for very short utterances).
    pub fn write(&self, data: &[u8], final_frame: bool) -> Result<()> {
        self.feed.write(data, final_frame)?;
        if !self.feed.has_prepared()
            && (self.feed.buffered() >= TTS_HEADER_SIZE || final_frame)
        {
            debug!(
                buffered = self.feed.buffered(),
                final_frame, "probe window ready, preparing tts player"
            );
            self.feed.mark_prepared();
            self.player.prepare_async()?;
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.player.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.feed.shutdown();
        self.player.stop()
    }

    pub fn reset(&self) -> Result<()> {
        self.feed.shutdown();
        self.player.reset()
    }

    pub fn state(&self) -> crate::player::PlayerState {
        self.player.state()
    }
}

impl Drop for TtsPlayer {
    fn drop(&mut self) {
        let _ = self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerState;
    use crate::sink::CollectSink;
    use std::sync::Mutex;
    use std::time::Duration;

    /// A WAV utterance pushed through the tts feed in dribbles plays to
    /// completion.
    #[test]
    fn streamed_wav_utterance_plays() -> anyhow::Result<()> {
        let tts = TtsPlayer::new(32 * 1024)?;
        let sink = CollectSink::new();
        let collected = sink.state();
        tts.register_sink(Arc::new(sink))?;
        let states = Arc::new(Mutex::new(Vec::new()));
        let log = states.clone();
        tts.set_state_listener(Arc::new(move |s, _| log.lock().unwrap().push(s)))?;

        tts.prepare_async()?;

        let data_size = 16000u32; // half a second, 16 kHz mono 16-bit
        let mut blob = crate::extractor::wav::make_header(16000, 1, 16, data_size);
        blob.resize(blob.len() + data_size as usize, 0x22);

        let mut started = false;
        let n_chunks = blob.len().div_ceil(1024);
        for (i, chunk) in blob.chunks(1024).enumerate() {
            tts.write(chunk, i + 1 == n_chunks)?;
            if !started && tts.state() == PlayerState::Prepared {
                tts.start()?;
                started = true;
            }
        }
        assert!(started, "player never prepared");

        for _ in 0..400 {
            if tts.state() == PlayerState::Completed {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tts.state(), PlayerState::Completed);
        assert_eq!(collected.lock().unwrap().data.len(), data_size as usize);
        Ok(())
    }

    #[test]
    fn write_before_prepare_is_rejected() {
        let tts = TtsPlayer::new(0).unwrap();
        assert!(tts.write(&[0u8; 16], false).is_err());
    }

    #[test]
    fn short_final_utterance_triggers_prepare() -> anyhow::Result<()> {
        let tts = TtsPlayer::new(0)?;
        tts.register_sink(Arc::new(CollectSink::new()))?;
        tts.prepare_async()?;
        // Under the probe window but final: prepare runs (and fails on junk,
        // which surfaces as a player error, not a hang).
        let res = tts.write(&[0u8; 300], true);
        assert!(res.is_err() || tts.state() == PlayerState::Error);
        Ok(())
    }
}
