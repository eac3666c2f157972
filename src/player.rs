//! Single-URL session player.
//!
//! One `Player` drives media parser → decoder element → PCM sink for one URL
//! at a time, exposing the prepare/start/pause/resume/seek/stop/reset state
//! machine. Illegal calls fail without mutating state. State callbacks are
//! serialized and delivered outside the player's locks; once an error has been
//! reported, only `Idle` and `Stopped` are still emitted until `reset`
//! (sticky-error rule).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::CodecInfo;
use crate::decoder;
use crate::element::{
    Element, ElementConfig, ElementEvent, ElementInput, ElementStatus, IoError, IoResult,
    SinkWriter, StreamInfo,
};
use crate::media_parser::{self, HandoffSlot, ParserTask};
use crate::media_source::{Feeder, FeederConfig, FeederEvent, SyncReader};
use crate::ringbuf::Ringbuf;
use crate::sink::{SinkAdapter, SinkDevice};
use crate::source::{RegisteredSource, SourceAdapter, SourceHandle, SourceRegistry};
use crate::{Error, Result};

const DECODER_INPUT_TIMEOUT: Duration = Duration::from_millis(200);
const WAIT_STOP_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerState {
    Idle,
    Inited,
    Prepared,
    Started,
    Paused,
    SeekCompleted,
    NearlyCompleted,
    Completed,
    Stopped,
    Error,
}

pub type PlayerStateListener = Arc<dyn Fn(PlayerState, i32) + Send + Sync>;

struct StateCell {
    state: PlayerState,
    sticky_error: bool,
    listener: Option<PlayerStateListener>,
}

#[derive(Default)]
struct Progress {
    sample_rate: AtomicU32,
    channels: AtomicU32,
    bits: AtomicU32,
    sink_position: AtomicU64,
    seek_time_ms: AtomicU32,
}

struct Session {
    url: String,
    source: RegisteredSource,
    sink: Arc<dyn SinkAdapter>,
    ringbuf: Arc<Ringbuf>,
    parser: Option<ParserTask>,
    feeder: Option<Feeder>,
    element: Option<Element>,
    seek_offset: u64,
}

pub struct Player {
    inner: Arc<PlayerInner>,
}

struct PlayerInner {
    me: Weak<PlayerInner>,
    registry: SourceRegistry,
    sink: Mutex<Option<Arc<dyn SinkAdapter>>>,
    session: Mutex<Option<Session>>,
    state: Mutex<StateCell>,
    /// Serializes listener invocation so observed transitions can't reorder.
    emit_lock: Mutex<()>,
    codec: Mutex<Option<CodecInfo>>,
    handoff: HandoffSlot,
    progress: Arc<Progress>,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|me| PlayerInner {
            me: me.clone(),
            registry: SourceRegistry::new(),
            sink: Mutex::new(None),
            session: Mutex::new(None),
            state: Mutex::new(StateCell {
                state: PlayerState::Idle,
                sticky_error: false,
                listener: None,
            }),
            emit_lock: Mutex::new(()),
            codec: Mutex::new(None),
            handoff: Arc::new(Mutex::new(None)),
            progress: Arc::new(Progress::default()),
        });
        Self { inner }
    }

    /// Register a source adapter. Only legal while idle.
    pub fn register_source(&self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        if self.state() != PlayerState::Idle {
            return Err(Error::InvalidState("register_source"));
        }
        self.inner.registry.register(adapter);
        Ok(())
    }

    /// Register the PCM sink. Only legal while idle.
    pub fn register_sink(&self, sink: Arc<dyn SinkAdapter>) -> Result<()> {
        if self.state() != PlayerState::Idle {
            return Err(Error::InvalidState("register_sink"));
        }
        *self.inner.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    /// Register the state listener. Only legal while idle.
    pub fn set_state_listener(&self, listener: PlayerStateListener) -> Result<()> {
        let mut cell = self.inner.state.lock().unwrap();
        if cell.state != PlayerState::Idle {
            return Err(Error::InvalidState("set_state_listener"));
        }
        cell.listener = Some(listener);
        Ok(())
    }

    pub fn state(&self) -> PlayerState {
        self.inner.state.lock().unwrap().state
    }

    pub fn set_data_source(&self, url: &str) -> Result<()> {
        info!(url, "set player source");
        let mut session = self.inner.session.lock().unwrap();
        if self.state() != PlayerState::Idle || session.is_some() {
            return Err(Error::InvalidState("set_data_source"));
        }
        let source = self.inner.registry.find(url)?;
        let sink = self
            .inner
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::AdapterUnavailable("no sink registered".into()))?;
        debug!(
            protocol = source.adapter.url_protocol(),
            buffer = source.buffer_size,
            "using source adapter"
        );
        let ringbuf = Arc::new(Ringbuf::new(source.buffer_size));
        *session = Some(Session {
            url: url.to_string(),
            source,
            sink,
            ringbuf,
            parser: None,
            feeder: None,
            element: None,
            seek_offset: 0,
        });
        self.inner.state.lock().unwrap().sticky_error = false;
        self.inner.transition(PlayerState::Inited, 0);
        Ok(())
    }

    /// Probe the source synchronously and build the pipeline.
    pub fn prepare(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("prepare"))?;
        if self.state() != PlayerState::Inited {
            return Err(Error::InvalidState("prepare"));
        }
        info!(url = %sess.url, "preparing player");
        self.inner.prepare_in_place(sess)
    }

    /// Probe asynchronously for network sources; sync sources prepare in place.
    pub fn prepare_async(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("prepare_async"))?;
        if self.state() != PlayerState::Inited {
            return Err(Error::InvalidState("prepare_async"));
        }
        info!(url = %sess.url, "async preparing player");

        if !sess.source.adapter.async_mode() {
            return self.inner.prepare_in_place(sess);
        }

        let weak = self.inner.me.clone();
        let task = ParserTask::start(
            sess.source.clone(),
            sess.url.clone(),
            sess.ringbuf.clone(),
            self.inner.handoff.clone(),
            Arc::new(move |result| {
                let Some(inner) = weak.upgrade() else { return };
                match result {
                    Ok(codec) => {
                        *inner.codec.lock().unwrap() = Some(codec);
                        inner.transition(PlayerState::Prepared, 0);
                    }
                    Err(e) => {
                        error!(%e, "async parse failed");
                        inner.transition(PlayerState::Error, -1);
                    }
                }
            }),
        );
        match task {
            Ok(task) => {
                sess.parser = Some(task);
                Ok(())
            }
            Err(e) => {
                self.inner.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("start"))?;
        let state = self.state();
        if !matches!(
            state,
            PlayerState::Prepared | PlayerState::Paused | PlayerState::SeekCompleted
        ) {
            return Err(Error::InvalidState("start"));
        }
        info!(url = %sess.url, "starting player");
        if let Some(parser) = sess.parser.take() {
            parser.stop();
        }

        let res = (|| -> Result<()> {
            if sess.element.is_none() {
                if state != PlayerState::Prepared {
                    return Err(Error::InvalidState("start without pipeline"));
                }
                self.inner.pipeline_init(sess)?;
            }
            sess.element.as_ref().expect("pipeline built").resume()
        })();
        match res {
            Ok(()) => {
                self.inner.transition(PlayerState::Started, 0);
                Ok(())
            }
            Err(e) => {
                error!(%e, "start failed");
                self.inner.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("pause"))?;
        if self.state() == PlayerState::Paused {
            return Ok(());
        }
        if self.state() != PlayerState::Started {
            return Err(Error::InvalidState("pause"));
        }
        info!(url = %sess.url, "pausing player");
        let res = sess
            .element
            .as_ref()
            .ok_or(Error::InvalidState("pause"))?
            .pause();
        match res {
            Ok(()) => {
                self.inner.transition(PlayerState::Paused, 0);
                Ok(())
            }
            Err(e) => {
                self.inner.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    pub fn resume(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("resume"))?;
        if !matches!(self.state(), PlayerState::Paused | PlayerState::SeekCompleted) {
            return Err(Error::InvalidState("resume"));
        }
        info!(url = %sess.url, "resuming player");
        let res = sess
            .element
            .as_ref()
            .ok_or(Error::InvalidState("resume"))?
            .resume();
        match res {
            Ok(()) => {
                self.inner.transition(PlayerState::Started, 0);
                Ok(())
            }
            Err(e) => {
                self.inner.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    /// Seek to `msec`. Out-of-range or unsupported seeks succeed without
    /// moving (notably raw AAC, which has no byte index).
    pub fn seek(&self, msec: u32) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let sess = session.as_mut().ok_or(Error::InvalidState("seek"))?;
        let state = self.state();
        if !matches!(
            state,
            PlayerState::Prepared
                | PlayerState::Started
                | PlayerState::Paused
                | PlayerState::SeekCompleted
        ) {
            return Err(Error::InvalidState("seek"));
        }
        info!(url = %sess.url, msec, "seeking player");

        let (offset, absolute) = {
            let mut codec_guard = self.inner.codec.lock().unwrap();
            let codec = codec_guard.as_mut().ok_or(Error::InvalidState("seek"))?;
            if codec.duration_ms > 0 && msec >= codec.duration_ms {
                warn!(msec, duration = codec.duration_ms, "seek beyond duration ignored");
                return Ok(());
            }
            match media_parser::seek_offset(codec, msec) {
                Some(offset) => (offset, codec.content_pos + offset),
                None => return Ok(()),
            }
        };

        sess.seek_offset = offset;
        self.inner
            .progress
            .seek_time_ms
            .store(msec / 1000 * 1000, Ordering::SeqCst);
        self.inner.progress.sink_position.store(0, Ordering::SeqCst);

        if let Some(parser) = sess.parser.take() {
            parser.stop();
        }

        let res = (|| -> Result<()> {
            if sess.element.is_none() {
                self.inner.pipeline_init(sess)?;
            } else {
                sess.element.as_ref().expect("element present").pause()?;
                if let Some(feeder) = sess.feeder.take() {
                    feeder.stop();
                }
                sess.ringbuf.reset();
                if sess.source.adapter.async_mode() {
                    let feeder = self.inner.start_feeder(sess, absolute, None)?;
                    sess.feeder = Some(feeder);
                }
            }
            sess.element.as_ref().expect("pipeline built").seek(absolute)
        })();
        match res {
            Ok(()) => {
                self.inner.transition(PlayerState::SeekCompleted, 0);
                Ok(())
            }
            Err(e) => {
                error!(%e, "seek failed");
                self.inner.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    pub fn stop(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        let state = self.state();
        if state == PlayerState::Stopped {
            return Ok(());
        }
        if state == PlayerState::Error {
            self.inner.transition(PlayerState::Stopped, 0);
            return Ok(());
        }
        if !matches!(
            state,
            PlayerState::Prepared
                | PlayerState::Started
                | PlayerState::Paused
                | PlayerState::SeekCompleted
                | PlayerState::NearlyCompleted
                | PlayerState::Completed
        ) {
            return Err(Error::InvalidState("stop"));
        }
        let sess = session.as_mut().ok_or(Error::InvalidState("stop"))?;
        info!(url = %sess.url, "stopping player");
        if let Some(element) = sess.element.as_ref() {
            let _ = element.stop();
            let _ = element.wait_for_stop(WAIT_STOP_TIMEOUT);
            element.reset_state();
            element.reset_input();
        }
        self.inner.transition(PlayerState::Stopped, 0);
        Ok(())
    }

    /// Full teardown back to `Idle`; legal from any state, including `Error`.
    pub fn reset(&self) -> Result<()> {
        let mut session = self.inner.session.lock().unwrap();
        if self.state() == PlayerState::Idle {
            return Ok(());
        }
        if let Some(mut sess) = session.take() {
            info!(url = %sess.url, "resetting player");
            if let Some(element) = sess.element.take() {
                element.terminate();
            }
            if let Some(parser) = sess.parser.take() {
                parser.stop();
            }
            if let Some(feeder) = sess.feeder.take() {
                feeder.stop();
            }
        }
        *self.inner.handoff.lock().unwrap() = None;
        *self.inner.codec.lock().unwrap() = None;
        let progress = &self.inner.progress;
        progress.sample_rate.store(0, Ordering::SeqCst);
        progress.channels.store(0, Ordering::SeqCst);
        progress.bits.store(0, Ordering::SeqCst);
        progress.sink_position.store(0, Ordering::SeqCst);
        progress.seek_time_ms.store(0, Ordering::SeqCst);

        if self.state() != PlayerState::Stopped {
            self.inner.transition(PlayerState::Stopped, 0);
        }
        self.inner.transition(PlayerState::Idle, 0);
        self.inner.state.lock().unwrap().sticky_error = false;
        Ok(())
    }

    /// Current position in milliseconds, derived from bytes written to the sink.
    pub fn position_ms(&self) -> u32 {
        let progress = &self.inner.progress;
        let rate = progress.sample_rate.load(Ordering::SeqCst);
        let channels = progress.channels.load(Ordering::SeqCst);
        let bits = progress.bits.load(Ordering::SeqCst);
        let seek_time = progress.seek_time_ms.load(Ordering::SeqCst);
        if rate == 0 || channels == 0 || bits == 0 {
            return 0;
        }
        let bytes_per_sample = (channels * bits / 8) as u64;
        let samples = progress.sink_position.load(Ordering::SeqCst) / bytes_per_sample;
        (samples / (rate as u64 / 1000)) as u32 + seek_time
    }

    pub fn duration_ms(&self) -> Result<u32> {
        if self.state() < PlayerState::Prepared {
            return Err(Error::InvalidState("duration"));
        }
        Ok(self
            .inner
            .codec
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.duration_ms)
            .unwrap_or(0))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.reset();
    }
}

impl PlayerInner {
    /// Record a state and notify the listener (outside the state lock, ordered
    /// by the emit lock).
    fn transition(&self, state: PlayerState, err: i32) {
        let _order = self.emit_lock.lock().unwrap();
        let listener = {
            let mut cell = self.state.lock().unwrap();
            cell.state = state;
            decide_listener(&mut cell, state)
        };
        if let Some(listener) = listener {
            listener(state, err);
        }
    }

    /// Notify without recording: used for the synthetic nearly-completed event.
    fn announce(&self, state: PlayerState, err: i32) {
        let _order = self.emit_lock.lock().unwrap();
        let listener = {
            let mut cell = self.state.lock().unwrap();
            decide_listener(&mut cell, state)
        };
        if let Some(listener) = listener {
            listener(state, err);
        }
    }

    fn prepare_in_place(&self, sess: &mut Session) -> Result<()> {
        let res = self
            .probe_blocking(sess)
            .and_then(|()| self.pipeline_init(sess));
        match res {
            Ok(()) => {
                self.transition(PlayerState::Prepared, 0);
                Ok(())
            }
            Err(e) => {
                error!(%e, "prepare failed");
                self.transition(PlayerState::Error, -1);
                Err(e)
            }
        }
    }

    fn probe_blocking(&self, sess: &mut Session) -> Result<()> {
        let probed = media_parser::probe(&sess.source, &sess.url)?;
        let (codec, handle) = probed.try_reuse_handle(&sess.ringbuf);
        *self.handoff.lock().unwrap() = handle;
        *self.codec.lock().unwrap() = Some(codec);
        Ok(())
    }

    fn start_feeder(
        &self,
        sess: &Session,
        content_pos: u64,
        handle: Option<Box<dyn SourceHandle>>,
    ) -> Result<Feeder> {
        let weak = self.me.clone();
        Feeder::start(FeederConfig {
            url: sess.url.clone(),
            adapter: sess.source.adapter.clone(),
            ringbuf: sess.ringbuf.clone(),
            content_pos,
            handle,
            listener: Arc::new(move |event| {
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    FeederEvent::ReadFailed | FeederEvent::WriteFailed => {
                        error!(?event, "media source failed");
                        inner.transition(PlayerState::Error, -1);
                    }
                    FeederEvent::ReadDone => {
                        debug!("media source drained");
                        inner.announce(PlayerState::NearlyCompleted, 0);
                    }
                    FeederEvent::WriteDone => {}
                }
            }),
        })
    }

    /// Build decoder element + byte mover for the probed codec.
    fn pipeline_init(&self, sess: &mut Session) -> Result<()> {
        let codec = self
            .codec
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidState("pipeline without codec info"))?;

        self.progress.sink_position.store(0, Ordering::SeqCst);
        self.progress.sample_rate.store(codec.sample_rate, Ordering::SeqCst);
        self.progress
            .channels
            .store(codec.channels as u32, Ordering::SeqCst);
        self.progress.bits.store(codec.bits as u32, Ordering::SeqCst);

        let reused = self.handoff.lock().unwrap().take();
        let start_pos = codec.content_pos + sess.seek_offset;

        let input = if sess.source.adapter.async_mode() {
            let feeder = self.start_feeder(sess, start_pos, reused)?;
            sess.feeder = Some(feeder);
            ElementInput::Ring(sess.ringbuf.clone())
        } else {
            ElementInput::Reader(Box::new(SyncReader::new(
                sess.source.adapter.clone(),
                sess.url.clone(),
                start_pos,
                sess.ringbuf.clone(),
                sess.source.buffer_size,
                reused,
            )))
        };

        let weak = self.me.clone();
        let ringbuf = sess.ringbuf.clone();
        let events: crate::element::EventCallback = Arc::new(move |tag, event| {
            let Some(inner) = weak.upgrade() else { return };
            inner.on_element_event(tag, event, &ringbuf);
        });

        let element = Element::spawn(ElementConfig {
            tag: decoder::element_tag(&codec).to_string(),
            input,
            output: Box::new(PlayerSink {
                adapter: sess.sink.clone(),
                device: None,
                progress: self.progress.clone(),
            }),
            processor: decoder::make_processor(&codec),
            events,
            input_timeout: Some(DECODER_INPUT_TIMEOUT),
        })?;
        sess.element = Some(element);
        Ok(())
    }

    fn on_element_event(&self, tag: &str, event: ElementEvent, ringbuf: &Ringbuf) {
        match event {
            ElementEvent::Status(status) => match status {
                ElementStatus::ErrorOpen
                | ElementStatus::ErrorInput
                | ElementStatus::ErrorProcess
                | ElementStatus::ErrorOutput => {
                    error!(tag, ?status, "element error");
                    self.transition(PlayerState::Error, -1);
                }
                ElementStatus::TimedOut => {
                    // Buffering stall; observable but never fatal.
                    warn!(
                        tag,
                        filled = ringbuf.bytes_filled(),
                        size = ringbuf.capacity(),
                        "decoder input timeout"
                    );
                }
                ElementStatus::Finished => {
                    let state = self.state.lock().unwrap().state;
                    if state < PlayerState::Started {
                        error!(tag, ?state, "decoder finished before start");
                        self.transition(PlayerState::Error, -1);
                    } else if state != PlayerState::Error && state != PlayerState::Stopped {
                        self.transition(PlayerState::Completed, 0);
                    }
                }
                ElementStatus::Running | ElementStatus::Paused | ElementStatus::Stopped => {
                    debug!(tag, ?status, "element status");
                }
            },
            ElementEvent::Info(info) => {
                info!(
                    tag,
                    sample_rate = info.sample_rate,
                    channels = info.channels,
                    bits = info.bits,
                    "decoder reported stream format"
                );
                self.progress
                    .sample_rate
                    .store(info.sample_rate, Ordering::SeqCst);
                self.progress
                    .channels
                    .store(info.channels as u32, Ordering::SeqCst);
                self.progress.bits.store(info.bits as u32, Ordering::SeqCst);
            }
            ElementEvent::Position(_) => {}
        }
    }
}

fn decide_listener(cell: &mut StateCell, state: PlayerState) -> Option<PlayerStateListener> {
    if state == PlayerState::Error {
        if cell.sticky_error {
            return None;
        }
        cell.sticky_error = true;
        return cell.listener.clone();
    }
    if cell.sticky_error && state != PlayerState::Idle && state != PlayerState::Stopped {
        return None;
    }
    cell.listener.clone()
}

/// Sink writer bridging the element output to the vendor PCM device.
struct PlayerSink {
    adapter: Arc<dyn SinkAdapter>,
    device: Option<Box<dyn SinkDevice>>,
    progress: Arc<Progress>,
}

impl SinkWriter for PlayerSink {
    fn open(&mut self, info: StreamInfo) -> std::result::Result<(), IoError> {
        if self.device.is_none() {
            info!(
                rate = info.sample_rate,
                channels = info.channels,
                bits = info.bits,
                "opening sink"
            );
            match self.adapter.open(info.sample_rate, info.channels, info.bits) {
                Ok(device) => self.device = Some(device),
                Err(e) => {
                    error!(%e, "failed to open sink");
                    return Err(IoError::Fail);
                }
            }
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        let device = self.device.as_mut().ok_or(IoError::Fail)?;
        match device.write(buf) {
            Ok(n) => {
                self.progress
                    .sink_position
                    .fetch_add(n as u64, Ordering::SeqCst);
                Ok(n)
            }
            Err(e) => {
                error!(%e, "sink write failed");
                Err(IoError::Fail)
            }
        }
    }

    fn close(&mut self, paused: bool) {
        if self.device.take().is_some() {
            debug!("closing sink");
        }
        if !paused {
            self.progress.sink_position.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use crate::source::memory::MemorySource;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    fn wav_blob(seconds: u32) -> Vec<u8> {
        let data_size = 16000 * 2 * seconds;
        let mut blob = crate::extractor::wav::make_header(16000, 1, 16, data_size);
        // A recognizable ramp so output bytes can be checked.
        for i in 0..(data_size / 2) {
            blob.extend_from_slice(&((i % 32768) as i16).to_le_bytes());
        }
        blob
    }

    /// Sink that takes ~1 ms per 20 ms block so playback is observable but
    /// still much faster than real time.
    struct ThrottledSink {
        inner: CollectSink,
    }

    struct ThrottledDevice {
        inner: Box<dyn SinkDevice>,
    }

    impl SinkAdapter for ThrottledSink {
        fn open(&self, sample_rate: u32, channels: u8, bits: u8) -> Result<Box<dyn SinkDevice>> {
            Ok(Box::new(ThrottledDevice {
                inner: self.inner.open(sample_rate, channels, bits)?,
            }))
        }
    }

    impl SinkDevice for ThrottledDevice {
        fn write(&mut self, pcm: &[u8]) -> Result<usize> {
            thread::sleep(Duration::from_millis(1));
            self.inner.write(pcm)
        }
    }

    fn player_with_blob(
        url: &str,
        blob: Vec<u8>,
        throttled: bool,
    ) -> (Player, Arc<StdMutex<crate::sink::CollectState>>, Arc<StdMutex<Vec<PlayerState>>>) {
        let player = Player::new();
        let mem = MemorySource::new("prebuilt");
        mem.register(url, blob);
        player.register_source(Arc::new(mem)).unwrap();
        let sink = CollectSink::new();
        let collected = sink.state();
        if throttled {
            player
                .register_sink(Arc::new(ThrottledSink { inner: sink }))
                .unwrap();
        } else {
            player.register_sink(Arc::new(sink)).unwrap();
        }
        let states = Arc::new(StdMutex::new(Vec::new()));
        let log = states.clone();
        player
            .set_state_listener(Arc::new(move |s, _e| log.lock().unwrap().push(s)))
            .unwrap();
        (player, collected, states)
    }

    fn wait_for(player: &Player, want: PlayerState) {
        for _ in 0..600 {
            if player.state() == want {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("player never reached {want:?}, state {:?}", player.state());
    }

    #[test]
    fn wav_playback_runs_to_completion() {
        let (player, collected, states) = player_with_blob("prebuilt://clip", wav_blob(1), false);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        assert_eq!(player.state(), PlayerState::Prepared);
        assert_eq!(player.duration_ms().unwrap(), 1000);

        player.start().unwrap();
        wait_for(&player, PlayerState::Completed);

        let collected = collected.lock().unwrap();
        assert_eq!(collected.opens, vec![(16000, 1, 16)]);
        assert_eq!(collected.data.len(), 32000);

        let seen = states.lock().unwrap();
        assert!(seen.contains(&PlayerState::Prepared));
        assert!(seen.contains(&PlayerState::Started));
        assert_eq!(*seen.last().unwrap(), PlayerState::Completed);
    }

    #[test]
    fn position_is_monotone_during_playback() {
        let (player, _collected, _states) = player_with_blob("prebuilt://clip", wav_blob(2), true);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        player.start().unwrap();
        let mut last = 0;
        for _ in 0..20 {
            let pos = player.position_ms();
            assert!(pos >= last, "position went backwards: {pos} < {last}");
            last = pos;
            if player.state() == PlayerState::Completed {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        wait_for(&player, PlayerState::Completed);
        assert!(player.position_ms() >= 1900);
    }

    #[test]
    fn illegal_calls_do_not_change_state() {
        let (player, _c, _s) = player_with_blob("prebuilt://clip", wav_blob(1), false);
        assert!(player.start().is_err());
        assert!(player.pause().is_err());
        assert_eq!(player.state(), PlayerState::Idle);

        player.set_data_source("prebuilt://clip").unwrap();
        assert!(player.start().is_err());
        assert!(player.set_data_source("prebuilt://clip").is_err());
        assert_eq!(player.state(), PlayerState::Inited);
    }

    #[test]
    fn error_source_reports_error_and_reset_recovers() {
        let (player, _c, states) = player_with_blob("prebuilt://junk", vec![0u8; 4096], false);
        player.set_data_source("prebuilt://junk").unwrap();
        assert!(player.prepare().is_err());
        assert_eq!(player.state(), PlayerState::Error);
        // Start after error is rejected.
        assert!(player.start().is_err());

        player.reset().unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
        let seen = states.lock().unwrap();
        // Sticky error: after Error only Stopped/Idle may surface.
        let err_at = seen.iter().position(|s| *s == PlayerState::Error).unwrap();
        for s in &seen[err_at + 1..] {
            assert!(matches!(s, PlayerState::Stopped | PlayerState::Idle));
        }
    }

    #[test]
    fn stop_then_reset_returns_to_idle() {
        let (player, _c, _s) = player_with_blob("prebuilt://clip", wav_blob(2), true);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        player.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        player.stop().unwrap();
        assert_eq!(player.state(), PlayerState::Stopped);
        // stop in Stopped is a no-op.
        player.stop().unwrap();
        player.reset().unwrap();
        assert_eq!(player.state(), PlayerState::Idle);
        // The player is reusable after reset.
        player.set_data_source("prebuilt://clip").unwrap();
        assert_eq!(player.state(), PlayerState::Inited);
    }

    #[test]
    fn pause_resume_round_trip() {
        let (player, collected, _s) = player_with_blob("prebuilt://clip", wav_blob(2), true);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        player.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        player.pause().unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        let at_pause = collected.lock().unwrap().data.len();
        thread::sleep(Duration::from_millis(30));
        // No data flows while paused.
        assert_eq!(collected.lock().unwrap().data.len(), at_pause);
        player.resume().unwrap();
        wait_for(&player, PlayerState::Completed);
        assert_eq!(collected.lock().unwrap().data.len(), 64000);
    }

    #[test]
    fn seek_repositions_within_tolerance() {
        let (player, _c, _s) = player_with_blob("prebuilt://clip", wav_blob(4), true);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        player.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        player.seek(2000).unwrap();
        assert_eq!(player.state(), PlayerState::SeekCompleted);
        player.resume().unwrap();
        thread::sleep(Duration::from_millis(50));
        let pos = player.position_ms();
        assert!(pos >= 2000, "position after seek: {pos}");
        assert!(pos <= 2600, "position after seek: {pos}");
    }

    #[test]
    fn seek_past_duration_is_a_noop() {
        let (player, _c, _s) = player_with_blob("prebuilt://clip", wav_blob(1), false);
        player.set_data_source("prebuilt://clip").unwrap();
        player.prepare().unwrap();
        player.seek(10_000).unwrap();
        assert_eq!(player.state(), PlayerState::Prepared);
    }
}
