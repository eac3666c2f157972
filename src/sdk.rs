//! The embedder-facing facade.
//!
//! `Sdk::init` builds the service, player stack, and recorder around the
//! vendor adapter; `start` wires them together: cloud commands fan out to the
//! player and recorder, player states fan back into the service, connectivity
//! losses play their reminder tones exactly once per edge, and the boot volume
//! is clamped into a sane range before anything makes noise.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::arbiter::Arbiter;
use crate::prompts::{self, PromptBlobs};
use crate::protocol::{Command, Domain, PlayerSyncReason, Status};
use crate::recorder::Recorder;
use crate::service::{CommandListener, Registry, Service, StatusListener};
use crate::source::memory::MemorySource;
use crate::stream_player::{StreamKind, StreamState, VendorStreamFactory};
use crate::vendor::VendorAdapter;
use crate::{Result, protocol};

const BOOT_VOLUME_MIN: i32 = 20;
const BOOT_VOLUME_MAX: i32 = 70;
/// Reported when the mixer cannot be read; kept from the reference behavior
/// but logged instead of silently substituted.
const FALLBACK_VOLUME: i32 = 50;

pub struct SdkConfig {
    pub adapter: Arc<dyn VendorAdapter>,
    pub prompts: PromptBlobs,
}

#[derive(Clone)]
pub struct Sdk {
    inner: Arc<SdkInner>,
}

#[derive(Default)]
struct EdgeFlags {
    network_down: bool,
    gateway_down: bool,
    unauthorized: bool,
}

struct SdkInner {
    adapter: Arc<dyn VendorAdapter>,
    service: Arc<Service>,
    arbiter: Arc<Arbiter>,
    recorder: Arc<Recorder>,
    prompt_blobs: Arc<MemorySource>,
    commands: Registry<CommandListener>,
    statuses: Registry<StatusListener>,
    edges: Mutex<EdgeFlags>,
    started: Mutex<bool>,
    wiring: Mutex<Vec<Wiring>>,
}

enum Wiring {
    Command(u64),
    Status(u64),
    TtsBinary(u64),
    ArbiterState(u64),
}

impl Sdk {
    pub fn init(config: SdkConfig) -> Result<Self> {
        let adapter = config.adapter;
        let service = Arc::new(Service::new(adapter.device_keys()));

        let factory = VendorStreamFactory::new(adapter.pcm_output());
        config.prompts.register_into(factory.prompts());
        let prompt_registry = factory.prompts().clone();
        let arbiter = Arc::new(Arbiter::new(Arc::new(factory))?);
        let recorder = Arc::new(Recorder::new(adapter.pcm_input(), service.clone()));

        Ok(Self {
            inner: Arc::new(SdkInner {
                adapter,
                service,
                arbiter,
                recorder,
                prompt_blobs: prompt_registry,
                commands: Registry::new(),
                statuses: Registry::new(),
                edges: Mutex::new(EdgeFlags::default()),
                started: Mutex::new(false),
                wiring: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The dialog service, for attaching the cloud transport and injecting
    /// decoded commands/statuses.
    pub fn service(&self) -> &Arc<Service> {
        &self.inner.service
    }

    /// Register an additional in-memory audio blob under a `prebuilt://` URL,
    /// playable through `on_new_prompt` or cloud play commands.
    pub fn register_prompt_blob(&self, url: &str, data: Vec<u8>) {
        self.inner.prompt_blobs.register(url, data);
    }

    pub fn register_command_listener(&self, listener: CommandListener) -> u64 {
        self.inner.commands.register(listener)
    }

    pub fn unregister_command_listener(&self, id: u64) {
        self.inner.commands.unregister(id);
    }

    pub fn register_status_listener(&self, listener: StatusListener) -> u64 {
        self.inner.statuses.register(listener)
    }

    pub fn unregister_status_listener(&self, id: u64) {
        self.inner.statuses.unregister(id);
    }

    pub fn is_active(&self) -> bool {
        *self.inner.started.lock().unwrap()
    }

    pub fn start(&self) -> Result<()> {
        let mut started = self.inner.started.lock().unwrap();
        if *started {
            info!("sdk already started");
            return Ok(());
        }
        info!("sdk starting");

        self.apply_boot_speaker_state();
        self.inner.service.start()?;
        self.wire_listeners();
        self.inner.recorder.start()?;

        *started = true;
        Ok(())
    }

    pub fn stop(&self) {
        let mut started = self.inner.started.lock().unwrap();
        if !*started {
            return;
        }
        info!("sdk stopping");
        self.inner.recorder.stop();
        self.inner.arbiter.on_stop();
        for wiring in self.inner.wiring.lock().unwrap().drain(..) {
            match wiring {
                Wiring::Command(id) => self.inner.service.unregister_command_listener(id),
                Wiring::Status(id) => self.inner.service.unregister_status_listener(id),
                Wiring::TtsBinary(id) => self.inner.service.unregister_tts_binary_listener(id),
                Wiring::ArbiterState(id) => self.inner.arbiter.unregister_state_listener(id),
            }
        }
        self.inner.service.stop();
        *started = false;
    }

    // --- the callback surface the external voice engine/transport invokes ---

    pub fn on_network_connected(&self) {
        self.inner.service.on_network_connected();
    }

    pub fn on_network_disconnected(&self) {
        self.inner.service.on_network_disconnected();
    }

    pub fn on_micphone_wakeup(&self, wakeup_word: &str, doa: i32, confidence: f64) {
        if self.inner.connectivity_ok() {
            self.inner
                .service
                .on_micphone_wakeup(wakeup_word, doa, confidence);
        }
    }

    pub fn on_micphone_silence(&self) {
        self.inner.service.on_micphone_silence();
    }

    pub fn on_speaker_volume_changed(&self, volume: i32) {
        self.inner.service.on_speaker_volume_changed(volume);
    }

    pub fn on_speaker_muted_changed(&self, muted: bool) {
        self.inner.service.on_speaker_muted_changed(muted);
    }

    pub fn on_text_recognize(&self, text: &str) {
        if self.inner.connectivity_ok() {
            self.inner.service.on_text_recognize(text);
        }
    }

    pub fn on_new_prompt(&self, url: &str) {
        self.inner.arbiter.on_new_prompt(url);
    }

    /// Clamp boot volume into the comfortable range and re-apply the persisted
    /// mute state.
    fn apply_boot_speaker_state(&self) {
        let Some(mixer) = self.inner.adapter.mixer() else {
            return;
        };
        let volume = match mixer.volume() {
            Ok(v) => v,
            Err(e) => {
                warn!(%e, fallback = FALLBACK_VOLUME, "mixer volume read failed");
                FALLBACK_VOLUME
            }
        };
        let clamped = volume.clamp(BOOT_VOLUME_MIN, BOOT_VOLUME_MAX);
        if mixer.set_volume(clamped).is_ok() {
            self.inner.service.on_speaker_volume_changed(clamped);
        }
        match mixer.muted() {
            Ok(muted) => {
                if mixer.set_muted(muted).is_ok() {
                    self.inner.service.on_speaker_muted_changed(muted);
                }
            }
            Err(e) => warn!(%e, "mixer mute read failed"),
        }
    }

    fn wire_listeners(&self) {
        let service = &self.inner.service;
        let mut wiring = self.inner.wiring.lock().unwrap();

        // Cloud commands drive the player.
        let arbiter = self.inner.arbiter.clone();
        wiring.push(Wiring::Command(service.register_command_listener(Arc::new(
            move |_domain, command, payload| match command {
                Command::Speak => {
                    let expect = protocol::parse_speak(payload)
                        .map(|p| p.expect_speech)
                        .unwrap_or(false);
                    arbiter.on_new_tts_header(expect);
                }
                Command::Play => {
                    if let Some(url) = protocol::parse_play(payload).and_then(|p| p.audio_url) {
                        arbiter.on_new_music(&url);
                    }
                }
                Command::PlayOnce => {
                    if let Some(url) = protocol::parse_play(payload).and_then(|p| p.audio_url) {
                        arbiter.on_new_prompt(&url);
                    }
                }
                Command::ClearQueue => arbiter.on_stop_playonce(),
                Command::Pause => arbiter.on_pause(),
                Command::Resume => arbiter.on_resume(),
                Command::Exit | Command::Standby => arbiter.on_stop(),
                _ => {}
            },
        ))));

        // Streamed TTS frames feed the TTS stream.
        let arbiter = self.inner.arbiter.clone();
        wiring.push(Wiring::TtsBinary(service.register_tts_binary_listener(
            Arc::new(move |data, final_frame| arbiter.on_new_tts_frame(data, final_frame)),
        )));

        // Dialog status drives ducking, the wake prompt, and the recorder gate.
        let arbiter = self.inner.arbiter.clone();
        let recorder = self.inner.recorder.clone();
        wiring.push(Wiring::Status(service.register_status_listener(Arc::new(
            move |status| {
                recorder.handle_status(status);
                match status {
                    Status::GatewayConnected => arbiter.on_gateway_connected(),
                    Status::GatewayDisconnected => arbiter.on_gateway_disconnected(),
                    Status::SpeakerMuted => arbiter.on_speaker_muted(),
                    Status::SpeakerUnmuted => arbiter.on_speaker_unmuted(),
                    Status::MicphoneWakeup => {
                        // Wake tone first; its idle opens the microphone.
                        arbiter.on_new_prompt_wakeup(prompts::WAKEUP_REMIND);
                    }
                    Status::MicphoneStarted => arbiter.on_micphone_started(),
                    Status::MicphoneStopped => arbiter.on_micphone_stopped(),
                    _ => {}
                }
            },
        ))));

        // Microphone commands gate the recorder.
        let recorder = self.inner.recorder.clone();
        wiring.push(Wiring::Command(service.register_command_listener(Arc::new(
            move |domain, command, payload| recorder.handle_command(domain, command, payload),
        ))));

        // Player state bridge: only music is user-visible; the wake prompt's
        // idle opens the microphone.
        let service_cb = service.clone();
        let music_completed = Arc::new(Mutex::new(false));
        wiring.push(Wiring::ArbiterState(self.inner.arbiter.register_state_listener(
            Arc::new(move |kind, state, _expect| {
                let is_music = kind == StreamKind::Music;
                match state {
                    StreamState::Idle => {
                        if is_music {
                            let mut completed = music_completed.lock().unwrap();
                            if !*completed {
                                service_cb.on_player_event(PlayerSyncReason::Stopped);
                            }
                            *completed = false;
                        } else if kind == StreamKind::PromptWakeup {
                            service_cb.on_expect_speech();
                        }
                    }
                    StreamState::Started if is_music => {
                        service_cb.on_player_event(PlayerSyncReason::Started);
                    }
                    StreamState::Paused if is_music => {
                        service_cb.on_player_event(PlayerSyncReason::Paused);
                    }
                    StreamState::Resumed if is_music => {
                        service_cb.on_player_event(PlayerSyncReason::Resumed);
                    }
                    StreamState::NearlyCompleted if is_music => {
                        service_cb.on_player_event(PlayerSyncReason::NearlyFinished);
                    }
                    StreamState::Completed if is_music => {
                        *music_completed.lock().unwrap() = true;
                        service_cb.on_player_event(PlayerSyncReason::Finished);
                    }
                    StreamState::Error if is_music => {
                        *music_completed.lock().unwrap() = true;
                        service_cb.on_player_event(PlayerSyncReason::Failed);
                    }
                    _ => {}
                }
            }),
        )));

        // Local speaker-volume handling plus fan-out to embedder listeners.
        let inner = self.inner.clone();
        wiring.push(Wiring::Command(service.register_command_listener(Arc::new(
            move |domain, command, payload| {
                if matches!(command, Command::Volume | Command::SetVolume) {
                    if let (Some(mixer), Some(value)) = (
                        inner.adapter.mixer(),
                        protocol::parse_volume(payload).and_then(|p| p.volume_value),
                    ) {
                        if mixer.set_volume(value).is_ok() {
                            inner.service.on_speaker_volume_changed(value);
                        }
                    }
                }
                for listener in inner.commands.snapshot() {
                    listener(domain, command, payload);
                }
            },
        ))));

        // Connectivity edges play their reminder exactly once, then fan out.
        let inner = self.inner.clone();
        wiring.push(Wiring::Status(service.register_status_listener(Arc::new(
            move |status| {
                inner.handle_connectivity_edge(status);
                for listener in inner.statuses.snapshot() {
                    listener(status);
                }
            },
        ))));
    }
}

impl SdkInner {
    /// One reminder per disconnect edge; reconnects clear silently.
    fn handle_connectivity_edge(&self, status: Status) {
        let mut edges = self.edges.lock().unwrap();
        match status {
            Status::NetworkConnected => edges.network_down = false,
            Status::NetworkDisconnected => {
                if !edges.network_down {
                    edges.network_down = true;
                    self.arbiter.on_stop_playonce();
                    self.arbiter.on_new_prompt(prompts::NETWORK_DISCONNECTED);
                }
            }
            Status::GatewayConnected => edges.gateway_down = false,
            Status::GatewayDisconnected => {
                if !edges.gateway_down && !edges.network_down && !edges.unauthorized {
                    edges.gateway_down = true;
                    self.arbiter.on_stop_playonce();
                    self.arbiter.on_new_prompt(prompts::SERVER_DISCONNECTED);
                }
            }
            Status::Authorized => edges.unauthorized = false,
            Status::Unauthorized => {
                if !edges.unauthorized {
                    edges.unauthorized = true;
                    self.arbiter.on_stop_playonce();
                    self.arbiter.on_new_prompt(prompts::ACCOUNT_UNAUTHORIZED);
                }
            }
            _ => {}
        }
    }

    /// Gate user-initiated dialog on connectivity, playing the matching
    /// reminder when the gate is closed.
    fn connectivity_ok(&self) -> bool {
        let edges = self.edges.lock().unwrap();
        let reminder = if edges.network_down {
            Some(prompts::NETWORK_DISCONNECTED)
        } else if edges.unauthorized {
            Some(prompts::ACCOUNT_UNAUTHORIZED)
        } else if edges.gateway_down {
            Some(prompts::SERVER_DISCONNECTED)
        } else {
            None
        };
        drop(edges);
        match reminder {
            Some(url) => {
                self.arbiter.on_stop_playonce();
                self.arbiter.on_new_prompt(url);
                false
            }
            None => true,
        }
    }
}

impl Drop for SdkInner {
    fn drop(&mut self) {
        self.recorder.stop();
        self.arbiter.shutdown();
    }
}
