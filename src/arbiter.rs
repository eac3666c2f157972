//! Multi-stream arbiter.
//!
//! Owns the four logical streams and enforces the interaction rules between
//! them: music ducks under any voice stream and resumes when the last one goes
//! idle; the wake prompt precedes the recorder; a `Speak` command that expects
//! an answer chains a record prompt after the TTS finishes. Commands and stream
//! state changes are serialized through one control thread, so the rules never
//! race each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tracing::{debug, error, info, warn};

use crate::prompts;
use crate::stream_player::{StreamControl, StreamFactory, StreamKind, StreamState};
use crate::{Error, Result};

/// Upward state listener: `(stream, state, expect_speech)`.
pub type ArbiterListener = Arc<dyn Fn(StreamKind, StreamState, bool) + Send + Sync>;

enum Msg {
    TtsHeader { expect_speech: bool },
    TtsFrame { data: Vec<u8>, final_frame: bool },
    NewPrompt(String),
    NewMusic(String),
    NewWakeupPrompt(String),
    PauseMusic,
    ResumeMusic,
    StopAll,
    StopPlayonce,
    GatewayConnected,
    GatewayDisconnected,
    SpeakerMuted,
    SpeakerUnmuted,
    MicStarted,
    MicStopped,
    StreamState {
        kind: StreamKind,
        state: StreamState,
        generation: u64,
    },
    Shutdown,
}

pub struct Arbiter {
    tx: Sender<Msg>,
    listeners: Arc<Listeners>,
    states: Arc<Mutex<HashMap<StreamKind, StreamState>>>,
    active: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, ArbiterListener)>>,
}

impl Listeners {
    fn notify(&self, kind: StreamKind, state: StreamState, expect_speech: bool) {
        let entries: Vec<ArbiterListener> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in entries {
            listener(kind, state, expect_speech);
        }
    }
}

impl Arbiter {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let listeners = Arc::new(Listeners {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        });
        let states = Arc::new(Mutex::new(HashMap::new()));
        let active = Arc::new(AtomicBool::new(true));

        let worker = {
            let tx = tx.clone();
            let listeners = listeners.clone();
            let states = states.clone();
            thread::Builder::new()
                .name("utp-arbiter".into())
                .spawn(move || {
                    Ctrl {
                        factory,
                        tx,
                        listeners,
                        shared_states: states,
                        streams: HashMap::new(),
                        generation: 0,
                        tts_expect_speech: false,
                        music_ducked: false,
                        music_user_paused: false,
                        music_stopped: true,
                        music_resuming: false,
                        resume_on_gateway: false,
                        mute_paused: Vec::new(),
                    }
                    .run(rx)
                })
                .map_err(|e| Error::msg(format!("failed to spawn arbiter: {e}")))?
        };

        Ok(Self {
            tx,
            listeners,
            states,
            active,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn register_state_listener(&self, listener: ArbiterListener) -> u64 {
        let id = self.listeners.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.entries.lock().unwrap().push((id, listener));
        id
    }

    pub fn unregister_state_listener(&self, id: u64) {
        self.listeners
            .entries
            .lock()
            .unwrap()
            .retain(|(lid, _)| *lid != id);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self, kind: StreamKind) -> bool {
        matches!(
            self.states.lock().unwrap().get(&kind),
            Some(StreamState::Started) | Some(StreamState::NearlyCompleted)
        )
    }

    fn send(&self, msg: Msg) {
        let _ = self.tx.send(msg);
    }

    /// New `Speak` directive: clear any running TTS and open a fresh stream.
    pub fn on_new_tts_header(&self, expect_speech: bool) {
        self.send(Msg::TtsHeader { expect_speech });
    }

    pub fn on_new_tts_frame(&self, data: &[u8], final_frame: bool) {
        self.send(Msg::TtsFrame {
            data: data.to_vec(),
            final_frame,
        });
    }

    pub fn on_new_prompt(&self, url: &str) {
        self.send(Msg::NewPrompt(url.to_string()));
    }

    pub fn on_new_music(&self, url: &str) {
        self.send(Msg::NewMusic(url.to_string()));
    }

    pub fn on_new_prompt_wakeup(&self, url: &str) {
        self.send(Msg::NewWakeupPrompt(url.to_string()));
    }

    pub fn on_pause(&self) {
        self.send(Msg::PauseMusic);
    }

    pub fn on_resume(&self) {
        self.send(Msg::ResumeMusic);
    }

    pub fn on_stop(&self) {
        self.send(Msg::StopAll);
    }

    pub fn on_stop_playonce(&self) {
        self.send(Msg::StopPlayonce);
    }

    pub fn on_gateway_connected(&self) {
        self.send(Msg::GatewayConnected);
    }

    pub fn on_gateway_disconnected(&self) {
        self.send(Msg::GatewayDisconnected);
    }

    pub fn on_speaker_muted(&self) {
        self.send(Msg::SpeakerMuted);
    }

    pub fn on_speaker_unmuted(&self) {
        self.send(Msg::SpeakerUnmuted);
    }

    pub fn on_micphone_started(&self) {
        self.send(Msg::MicStarted);
    }

    pub fn on_micphone_stopped(&self) {
        self.send(Msg::MicStopped);
    }

    pub fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Arbiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Ctrl {
    factory: Arc<dyn StreamFactory>,
    tx: Sender<Msg>,
    listeners: Arc<Listeners>,
    shared_states: Arc<Mutex<HashMap<StreamKind, StreamState>>>,
    streams: HashMap<StreamKind, (u64, Arc<dyn StreamControl>)>,
    generation: u64,
    tts_expect_speech: bool,
    music_ducked: bool,
    music_user_paused: bool,
    music_stopped: bool,
    /// The next music `Started` is a resume and is reported as `Resumed`.
    music_resuming: bool,
    resume_on_gateway: bool,
    mute_paused: Vec<StreamKind>,
}

impl Ctrl {
    fn run(mut self, rx: Receiver<Msg>) {
        debug!("arbiter control thread running");
        while let Ok(msg) = rx.recv() {
            if matches!(msg, Msg::Shutdown) {
                break;
            }
            self.handle(msg);
        }
        self.drop_stream(StreamKind::Tts);
        self.drop_stream(StreamKind::Prompt);
        self.drop_stream(StreamKind::PromptWakeup);
        self.drop_stream(StreamKind::Music);
        debug!("arbiter control thread leaving");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::TtsHeader { expect_speech } => self.on_tts_header(expect_speech),
            Msg::TtsFrame { data, final_frame } => self.on_tts_frame(&data, final_frame),
            Msg::NewPrompt(url) => self.open_stream(StreamKind::Prompt, &url),
            Msg::NewMusic(url) => {
                self.music_user_paused = false;
                self.music_stopped = false;
                self.music_resuming = false;
                self.open_stream(StreamKind::Music, &url);
            }
            Msg::NewWakeupPrompt(url) => self.open_stream(StreamKind::PromptWakeup, &url),
            Msg::PauseMusic => {
                self.music_user_paused = true;
                self.pause_music();
            }
            Msg::ResumeMusic => {
                self.music_user_paused = false;
                self.resume_music();
            }
            Msg::StopAll => self.stop_all(),
            Msg::StopPlayonce => self.drop_stream(StreamKind::Prompt),
            Msg::GatewayConnected => {
                if self.resume_on_gateway {
                    self.resume_on_gateway = false;
                    self.resume_music();
                }
            }
            Msg::GatewayDisconnected => {
                // Network-backed streams cannot survive the gateway loss: the
                // TTS feed is dead, music pauses until reconnect.
                self.drop_stream(StreamKind::Tts);
                if self.music_is(StreamState::Started) {
                    self.pause_music();
                    self.resume_on_gateway = true;
                }
            }
            Msg::SpeakerMuted => self.mute_all(),
            Msg::SpeakerUnmuted => self.unmute_all(),
            Msg::MicStarted | Msg::MicStopped => {
                debug!("microphone state change observed");
            }
            Msg::StreamState {
                kind,
                state,
                generation,
            } => self.on_stream_state(kind, state, generation),
            Msg::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn current(&self, kind: StreamKind) -> Option<&Arc<dyn StreamControl>> {
        self.streams.get(&kind).map(|(_, s)| s)
    }

    fn music_is(&self, state: StreamState) -> bool {
        self.shared_states.lock().unwrap().get(&StreamKind::Music) == Some(&state)
    }

    fn drop_stream(&mut self, kind: StreamKind) {
        if let Some((_, stream)) = self.streams.remove(&kind) {
            debug!(?kind, "dropping stream");
            let _ = stream.stop();
            let _ = stream.reset();
        }
        self.shared_states.lock().unwrap().remove(&kind);
    }

    /// Create a fresh stream instance for `kind` and point it at `url`.
    fn open_stream(&mut self, kind: StreamKind, url: &str) {
        info!(?kind, url, "opening stream");
        self.drop_stream(kind);
        if kind != StreamKind::Music {
            self.duck_music();
        }

        self.generation += 1;
        let generation = self.generation;
        let stream = match self.factory.create(kind) {
            Ok(s) => s,
            Err(e) => {
                error!(?kind, %e, "failed to create stream");
                return;
            }
        };
        let tx = self.tx.clone();
        let _ = stream.set_state_listener(Arc::new(move |kind, state| {
            let _ = tx.send(Msg::StreamState {
                kind,
                state,
                generation,
            });
        }));
        let opened = stream
            .set_data_source(url)
            .and_then(|()| stream.prepare_async());
        if let Err(e) = opened {
            error!(?kind, url, %e, "failed to open stream");
            let _ = stream.reset();
            // An unplayable prompt must not leave music ducked forever.
            self.maybe_resume_music();
            return;
        }
        self.streams.insert(kind, (generation, stream));
    }

    fn on_tts_header(&mut self, expect_speech: bool) {
        info!(expect_speech, "new tts utterance");
        self.drop_stream(StreamKind::Tts);
        self.duck_music();
        self.tts_expect_speech = expect_speech;

        self.generation += 1;
        let generation = self.generation;
        let stream = match self.factory.create(StreamKind::Tts) {
            Ok(s) => s,
            Err(e) => {
                error!(%e, "failed to create tts stream");
                return;
            }
        };
        let tx = self.tx.clone();
        let _ = stream.set_state_listener(Arc::new(move |kind, state| {
            let _ = tx.send(Msg::StreamState {
                kind,
                state,
                generation,
            });
        }));
        if let Err(e) = stream.prepare_async() {
            error!(%e, "failed to arm tts stream");
            return;
        }
        self.streams.insert(StreamKind::Tts, (generation, stream));
    }

    fn on_tts_frame(&mut self, data: &[u8], final_frame: bool) {
        let Some(stream) = self.current(StreamKind::Tts) else {
            warn!("tts frame without an armed stream");
            return;
        };
        if let Err(e) = stream.write(data, final_frame) {
            warn!(%e, "tts frame dropped");
        }
    }

    fn duck_music(&mut self) {
        if self.music_is(StreamState::Started) {
            debug!("ducking music");
            if let Some(music) = self.current(StreamKind::Music) {
                if music.pause().is_ok() {
                    self.music_ducked = true;
                }
            }
        }
    }

    fn pause_music(&mut self) {
        if let Some(music) = self.current(StreamKind::Music) {
            let _ = music.pause();
        }
        self.music_ducked = false;
    }

    fn resume_music(&mut self) {
        if let Some(music) = self.current(StreamKind::Music) {
            if self.music_is(StreamState::Paused) && music.resume().is_ok() {
                self.music_resuming = true;
            }
        }
        self.music_ducked = false;
    }

    /// Resume ducked music once every voice stream is gone.
    fn maybe_resume_music(&mut self) {
        if !self.music_ducked || self.music_user_paused || self.music_stopped {
            return;
        }
        let voices_busy = [StreamKind::Tts, StreamKind::Prompt, StreamKind::PromptWakeup]
            .iter()
            .any(|k| self.streams.contains_key(k));
        if voices_busy {
            return;
        }
        debug!("voice streams idle, resuming music");
        self.resume_music();
    }

    fn stop_all(&mut self) {
        info!("stopping all streams");
        self.music_stopped = true;
        self.music_ducked = false;
        self.resume_on_gateway = false;
        self.drop_stream(StreamKind::Tts);
        self.drop_stream(StreamKind::Prompt);
        self.drop_stream(StreamKind::PromptWakeup);
        self.drop_stream(StreamKind::Music);
    }

    fn mute_all(&mut self) {
        info!("speaker muted, pausing streams");
        self.mute_paused.clear();
        // TTS cannot pause; it is torn down like on gateway loss.
        self.drop_stream(StreamKind::Tts);
        for kind in [StreamKind::Prompt, StreamKind::PromptWakeup, StreamKind::Music] {
            let started = self.shared_states.lock().unwrap().get(&kind)
                == Some(&StreamState::Started);
            if started {
                if let Some(stream) = self.current(kind) {
                    if stream.pause().is_ok() {
                        self.mute_paused.push(kind);
                    }
                }
            }
        }
    }

    fn unmute_all(&mut self) {
        info!("speaker unmuted, resuming streams");
        for kind in std::mem::take(&mut self.mute_paused) {
            if kind == StreamKind::Music {
                self.resume_music();
            } else if let Some(stream) = self.current(kind) {
                let _ = stream.resume();
            }
        }
    }

    fn on_stream_state(&mut self, kind: StreamKind, state: StreamState, generation: u64) {
        let current = self.streams.get(&kind).map(|(g, _)| *g) == Some(generation);
        debug!(?kind, ?state, generation, current, "stream state");

        // Stale events (from replaced instances) are still forwarded so the
        // service-side bookkeeping sees terminal states, but they no longer
        // drive arbitration.
        if current {
            self.shared_states.lock().unwrap().insert(kind, state);
            match state {
                StreamState::Prepared => {
                    if let Some(stream) = self.current(kind) {
                        if let Err(e) = stream.start() {
                            error!(?kind, %e, "failed to start prepared stream");
                        }
                    }
                }
                StreamState::Started => {
                    if kind != StreamKind::Music {
                        self.duck_music();
                    }
                }
                StreamState::Completed | StreamState::Error => {
                    if let Some(stream) = self.current(kind) {
                        let _ = stream.reset();
                    }
                }
                StreamState::Idle => {
                    self.streams.remove(&kind);
                    self.shared_states.lock().unwrap().remove(&kind);
                    if kind == StreamKind::Tts && self.tts_expect_speech {
                        // The answer is expected: cue the record tone, whose
                        // own idle will open the microphone.
                        self.tts_expect_speech = false;
                        self.open_stream(StreamKind::PromptWakeup, prompts::RECORD_REMIND);
                    } else {
                        self.maybe_resume_music();
                    }
                }
                _ => {}
            }
        }

        // Synthesized resume reporting for music.
        let mut report = state;
        if kind == StreamKind::Music && state == StreamState::Started && self.music_resuming {
            self.music_resuming = false;
            report = StreamState::Resumed;
        }
        let expect = self.tts_expect_speech;
        self.listeners.notify(kind, report, expect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Scripted stream: records calls and emits plausible state transitions.
    struct FakeStream {
        kind: StreamKind,
        calls: Arc<Mutex<Vec<String>>>,
        listener: Mutex<Option<crate::stream_player::StreamStateListener>>,
        auto: bool,
    }

    impl FakeStream {
        fn emit(&self, state: StreamState) {
            if let Some(listener) = self.listener.lock().unwrap().clone() {
                listener(self.kind, state);
            }
        }

        fn log(&self, call: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{:?}:{call}", self.kind));
        }
    }

    impl StreamControl for FakeStream {
        fn kind(&self) -> StreamKind {
            self.kind
        }
        fn set_state_listener(
            &self,
            listener: crate::stream_player::StreamStateListener,
        ) -> Result<()> {
            *self.listener.lock().unwrap() = Some(listener);
            Ok(())
        }
        fn set_data_source(&self, url: &str) -> Result<()> {
            self.log(&format!("set_source {url}"));
            Ok(())
        }
        fn prepare_async(&self) -> Result<()> {
            self.log("prepare");
            if self.auto {
                self.emit(StreamState::Prepared);
            }
            Ok(())
        }
        fn write(&self, data: &[u8], final_frame: bool) -> Result<()> {
            self.log(&format!("write {} final={final_frame}", data.len()));
            Ok(())
        }
        fn start(&self) -> Result<()> {
            self.log("start");
            if self.auto {
                self.emit(StreamState::Started);
            }
            Ok(())
        }
        fn pause(&self) -> Result<()> {
            self.log("pause");
            if self.auto {
                self.emit(StreamState::Paused);
            }
            Ok(())
        }
        fn resume(&self) -> Result<()> {
            self.log("resume");
            if self.auto {
                self.emit(StreamState::Started);
            }
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            self.log("stop");
            Ok(())
        }
        fn reset(&self) -> Result<()> {
            self.log("reset");
            if self.auto {
                self.emit(StreamState::Idle);
            }
            Ok(())
        }
        fn position_ms(&self) -> Option<u32> {
            None
        }
        fn duration_ms(&self) -> Option<u32> {
            None
        }
    }

    struct FakeFactory {
        calls: Arc<Mutex<Vec<String>>>,
        made: Arc<Mutex<Vec<Arc<FakeStream>>>>,
    }

    impl StreamFactory for FakeFactory {
        fn create(&self, kind: StreamKind) -> Result<Arc<dyn StreamControl>> {
            let stream = Arc::new(FakeStream {
                kind,
                calls: self.calls.clone(),
                listener: Mutex::new(None),
                auto: true,
            });
            self.made.lock().unwrap().push(stream.clone());
            Ok(stream)
        }
    }

    struct Rig {
        arbiter: Arbiter,
        calls: Arc<Mutex<Vec<String>>>,
        made: Arc<Mutex<Vec<Arc<FakeStream>>>>,
        events: Arc<Mutex<Vec<(StreamKind, StreamState)>>>,
    }

    fn rig() -> Rig {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let made = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(FakeFactory {
            calls: calls.clone(),
            made: made.clone(),
        });
        let arbiter = Arbiter::new(factory).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        arbiter.register_state_listener(Arc::new(move |kind, state, _expect| {
            sink.lock().unwrap().push((kind, state));
        }));
        Rig {
            arbiter,
            calls,
            made,
            events,
        }
    }

    fn wait_for_call(calls: &Arc<Mutex<Vec<String>>>, needle: &str) {
        for _ in 0..400 {
            if calls.lock().unwrap().iter().any(|c| c.contains(needle)) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("never saw call {needle:?}; calls: {:?}", calls.lock().unwrap());
    }

    fn last_stream(rig: &Rig, kind: StreamKind) -> Arc<FakeStream> {
        rig.made
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.kind == kind)
            .expect("stream created")
            .clone()
    }

    #[test]
    fn music_plays_through_prepare_start() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:set_source http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        for _ in 0..100 {
            if rig.arbiter.is_playing(StreamKind::Music) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("music never started");
    }

    #[test]
    fn tts_ducks_music_and_resume_follows() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");

        rig.arbiter.on_new_tts_header(false);
        wait_for_call(&rig.calls, "Music:pause");
        wait_for_call(&rig.calls, "Tts:prepare");

        // TTS runs to completion; arbiter resets it and music resumes.
        let tts = last_stream(&rig, StreamKind::Tts);
        tts.emit(StreamState::Completed);
        wait_for_call(&rig.calls, "Tts:reset");
        wait_for_call(&rig.calls, "Music:resume");

        // The resumed start is reported as Resumed, not Started.
        for _ in 0..200 {
            if rig
                .events
                .lock()
                .unwrap()
                .contains(&(StreamKind::Music, StreamState::Resumed))
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("resume was not reported");
    }

    #[test]
    fn expect_speech_chains_record_prompt() {
        let rig = rig();
        rig.arbiter.on_new_tts_header(true);
        wait_for_call(&rig.calls, "Tts:prepare");
        rig.arbiter.on_new_tts_frame(&[0u8; 128], true);
        wait_for_call(&rig.calls, "write 128 final=true");

        let tts = last_stream(&rig, StreamKind::Tts);
        tts.emit(StreamState::Completed);
        wait_for_call(&rig.calls, &format!("PromptWakeup:set_source {}", prompts::RECORD_REMIND));
        wait_for_call(&rig.calls, "PromptWakeup:start");

        // Wakeup prompt completion surfaces the idle the bridge turns into
        // expect-speech.
        let wakeup = last_stream(&rig, StreamKind::PromptWakeup);
        wakeup.emit(StreamState::Completed);
        for _ in 0..200 {
            if rig
                .events
                .lock()
                .unwrap()
                .contains(&(StreamKind::PromptWakeup, StreamState::Idle))
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("wakeup idle never surfaced");
    }

    #[test]
    fn gateway_loss_pauses_music_and_reconnect_resumes() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        rig.arbiter.on_gateway_disconnected();
        wait_for_call(&rig.calls, "Music:pause");
        rig.arbiter.on_gateway_connected();
        wait_for_call(&rig.calls, "Music:resume");
    }

    #[test]
    fn mute_pauses_everything_and_unmute_restores() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        rig.arbiter.on_speaker_muted();
        wait_for_call(&rig.calls, "Music:pause");
        rig.arbiter.on_speaker_unmuted();
        wait_for_call(&rig.calls, "Music:resume");
    }

    #[test]
    fn user_pause_blocks_duck_resume() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        rig.arbiter.on_pause();
        wait_for_call(&rig.calls, "Music:pause");

        // A prompt comes and goes; paused-by-user music must stay paused.
        rig.arbiter.on_new_prompt("prebuilt://beep");
        wait_for_call(&rig.calls, "Prompt:start");
        let prompt = last_stream(&rig, StreamKind::Prompt);
        prompt.emit(StreamState::Completed);
        wait_for_call(&rig.calls, "Prompt:reset");
        thread::sleep(Duration::from_millis(50));
        assert!(
            !rig.calls.lock().unwrap().iter().any(|c| c == "Music:resume"),
            "music resumed despite user pause"
        );
    }

    #[test]
    fn exit_stops_every_stream() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        rig.arbiter.on_new_prompt("prebuilt://beep");
        wait_for_call(&rig.calls, "Prompt:start");
        rig.arbiter.on_stop();
        wait_for_call(&rig.calls, "Music:stop");
        wait_for_call(&rig.calls, "Prompt:stop");
        assert!(!rig.arbiter.is_playing(StreamKind::Music));
    }

    #[test]
    fn stop_playonce_clears_prompt_only() {
        let rig = rig();
        rig.arbiter.on_new_music("http://cdn/song.mp3");
        wait_for_call(&rig.calls, "Music:start");
        rig.arbiter.on_new_prompt("prebuilt://beep");
        wait_for_call(&rig.calls, "Prompt:start");
        rig.arbiter.on_stop_playonce();
        wait_for_call(&rig.calls, "Prompt:stop");
        assert!(
            !rig.calls.lock().unwrap().iter().any(|c| c == "Music:stop"),
            "music was stopped by playonce clear"
        );
    }
}
