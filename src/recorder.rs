//! Utterance recorder.
//!
//! One worker thread parks on a condvar until a dialog turn opens the
//! microphone, then pulls 30 ms PCM frames from the capture device and streams
//! them to the service until silence is signalled or the 15 s utterance budget
//! runs out (whichever the wallclock or the byte count hits first). The final
//! frame is always emitted with `final_frame = true` and zero-padded to a full
//! frame, as the upload framing requires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::protocol::{Command, Domain, SpeechFormat, Status};
use crate::vendor::{CaptureAdapter, CaptureDevice};
use crate::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u8 = 1;
pub const SAMPLE_BITS: u8 = 16;
pub const FRAME_MS: u32 = 30;
pub const FRAME_BYTES: usize =
    (SAMPLE_RATE as usize / 1000 * FRAME_MS as usize) * CHANNELS as usize * SAMPLE_BITS as usize / 8;
pub const BYTES_PER_SECOND: u32 = SAMPLE_RATE * CHANNELS as u32 * SAMPLE_BITS as u32 / 8;
pub const MAX_UTTERANCE_MS: u32 = 15_000;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Where captured speech frames go (the service, in production).
pub trait SpeechSink: Send + Sync {
    fn on_speech_frame(&self, format: SpeechFormat, data: &[u8], final_frame: bool);
}

#[derive(Default)]
struct Gate {
    network: bool,
    gateway: bool,
    authorized: bool,
    unmuted: bool,
}

struct RecState {
    recording: bool,
    thread_running: bool,
    started_at: Option<Instant>,
}

struct RecorderInner {
    capture: Arc<dyn CaptureAdapter>,
    sink: Arc<dyn SpeechSink>,
    state: Mutex<RecState>,
    cond: Condvar,
    gate: Mutex<Gate>,
    active: AtomicBool,
}

pub struct Recorder {
    inner: Arc<RecorderInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(capture: Arc<dyn CaptureAdapter>, sink: Arc<dyn SpeechSink>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                capture,
                sink,
                state: Mutex::new(RecState {
                    recording: false,
                    thread_running: false,
                    started_at: None,
                }),
                cond: Condvar::new(),
                // Optimistic until the service says otherwise.
                gate: Mutex::new(Gate {
                    network: true,
                    gateway: true,
                    authorized: true,
                    unmuted: true,
                }),
                active: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            debug!("recorder already started");
            return Ok(());
        }
        self.inner.state.lock().unwrap().thread_running = true;
        self.inner.active.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || inner.run())
            .map_err(|e| Error::msg(format!("failed to spawn recorder: {e}")))?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.thread_running = false;
            state.recording = false;
            self.inner.cond.notify_all();
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        self.inner.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().unwrap().recording
    }

    /// Dialog commands gating the microphone.
    pub fn handle_command(&self, _domain: Domain, command: Command, _payload: &str) {
        match command {
            Command::ExpectSpeechStart => {
                let gate_open = {
                    let gate = self.inner.gate.lock().unwrap();
                    gate.network && gate.gateway && gate.authorized && gate.unmuted
                };
                if !gate_open {
                    warn!("expect-speech ignored, dialog gate closed");
                    return;
                }
                info!("opening microphone");
                let mut state = self.inner.state.lock().unwrap();
                state.recording = true;
                state.started_at = Some(Instant::now());
                self.inner.cond.notify_all();
            }
            Command::ExpectSpeechStop | Command::StopListen => {
                debug!("closing microphone");
                self.inner.state.lock().unwrap().recording = false;
            }
            _ => {}
        }
    }

    /// Connectivity transitions close the gate (and any live capture).
    pub fn handle_status(&self, status: Status) {
        let mut gate = self.inner.gate.lock().unwrap();
        let mut stop_recording = false;
        match status {
            Status::NetworkDisconnected => {
                gate.network = false;
                stop_recording = true;
            }
            Status::NetworkConnected => gate.network = true,
            Status::GatewayDisconnected => {
                gate.gateway = false;
                stop_recording = true;
            }
            Status::GatewayConnected => gate.gateway = true,
            Status::Unauthorized => {
                gate.authorized = false;
                stop_recording = true;
            }
            Status::Authorized => gate.authorized = true,
            Status::SpeakerMuted => {
                gate.unmuted = false;
                stop_recording = true;
            }
            Status::SpeakerUnmuted => gate.unmuted = true,
            // Wakeup is the player's cue (wake prompt, then expect-speech),
            // never the recorder's.
            Status::MicphoneWakeup | Status::MicphoneStarted | Status::MicphoneStopped => {}
        }
        drop(gate);
        if stop_recording {
            self.inner.state.lock().unwrap().recording = false;
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RecorderInner {
    fn run(&self) {
        debug!("recorder thread enter");
        loop {
            // Park until a turn starts or we shut down.
            {
                let mut state = self.state.lock().unwrap();
                while state.thread_running && !state.recording {
                    state = self.cond.wait(state).unwrap();
                }
                if !state.thread_running {
                    break;
                }
            }
            self.capture_utterance();
            if !self.state.lock().unwrap().thread_running {
                break;
            }
        }
        debug!("recorder thread leave");
    }

    fn should_capture(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.thread_running && state.recording
    }

    fn capture_utterance(&self) {
        let mut device: Option<Box<dyn CaptureDevice>> = None;
        let mut frame = [0u8; FRAME_BYTES];
        let mut captured_ms: u64 = 0;

        while self.should_capture() {
            if device.is_none() {
                match self.capture.open(SAMPLE_RATE, CHANNELS, SAMPLE_BITS) {
                    Ok(d) => device = Some(d),
                    Err(e) => {
                        error!(%e, "failed to open capture device");
                        thread::sleep(RETRY_BACKOFF);
                        continue;
                    }
                }
            }

            match device.as_mut().expect("capture open").read(&mut frame) {
                Ok(n) if n > 0 => {
                    self.sink
                        .on_speech_frame(SpeechFormat::Pcm, &frame[..n], false);
                    captured_ms += n as u64 * 1000 / BYTES_PER_SECOND as u64;
                }
                Ok(_) => {
                    // Capture not ready yet; retry shortly.
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    error!(%e, "capture read failed");
                    thread::sleep(RETRY_BACKOFF);
                }
            }

            let wallclock_ms = self
                .state
                .lock()
                .unwrap()
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);
            if wallclock_ms >= MAX_UTTERANCE_MS as u64 || captured_ms >= MAX_UTTERANCE_MS as u64 {
                warn!(wallclock_ms, captured_ms, "utterance budget reached, closing microphone");
                self.state.lock().unwrap().recording = false;
            }
        }

        // Final frame: whatever the device still has, padded to a whole frame.
        if let Some(mut device) = device {
            let n = device.read(&mut frame).unwrap_or(0);
            if n < FRAME_BYTES {
                frame[n..].fill(0);
            }
            self.sink.on_speech_frame(SpeechFormat::Pcm, &frame, true);
            debug!("capture closed after final frame");
        }
    }
}
