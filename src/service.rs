//! Dialog service coordinator.
//!
//! Owns the global dialog status (network / gateway / authorization / speaker /
//! microphone), fans decoded cloud commands out to registered listeners, and
//! publishes the events the core produces (speech chunks, recognized text,
//! player state) to the attached transport. The transport itself, a websocket
//! to the cloud, lives outside this crate; tests drive the service directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::protocol::{
    Command, Domain, MicrophoneActiveReason, PlayerSyncReason, SpeakerContext, SpeakerSyncReason,
    SpeechContext, SpeechFormat, StateSyncReason, Status,
};
use crate::recorder::SpeechSink;
use crate::vendor::DeviceKeys;

pub type CommandListener = Arc<dyn Fn(Domain, Command, &str) + Send + Sync>;
pub type StatusListener = Arc<dyn Fn(Status) + Send + Sync>;
pub type TtsBinaryListener = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

/// Outbound events the transport ships to the cloud.
#[allow(unused_variables)]
pub trait TransportEvents: Send + Sync {
    fn on_microphone_active(&self, reason: MicrophoneActiveReason) {}
    fn on_listen_started(&self, ctx: &SpeechContext) {}
    fn on_speech_chunk(&self, format: SpeechFormat, data: &[u8], final_frame: bool) {}
    fn on_text_recognize(&self, text: &str) {}
    fn on_player_sync(&self, reason: PlayerSyncReason) {}
    fn on_speaker_sync(&self, reason: SpeakerSyncReason, ctx: &SpeakerContext) {}
    fn on_state_sync(&self, reason: StateSyncReason) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    Idle,
    Wakeup,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceStatus {
    pub network_connected: bool,
    pub gateway_connected: bool,
    pub authorized: bool,
    pub speaker_muted: bool,
    pub microphone: MicrophoneState,
}

pub(crate) struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, T)>>,
}

impl<T: Clone> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, listener: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().push((id, listener));
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.entries.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }
}

pub struct Service {
    keys: DeviceKeys,
    transport: Mutex<Option<Arc<dyn TransportEvents>>>,
    commands: Registry<CommandListener>,
    statuses: Registry<StatusListener>,
    tts_binary: Registry<TtsBinaryListener>,
    status: Mutex<ServiceStatus>,
    active: AtomicBool,
    streaming: AtomicBool,
}

impl Service {
    pub fn new(keys: DeviceKeys) -> Self {
        Self {
            keys,
            transport: Mutex::new(None),
            commands: Registry::new(),
            statuses: Registry::new(),
            tts_binary: Registry::new(),
            status: Mutex::new(ServiceStatus {
                network_connected: false,
                gateway_connected: false,
                authorized: false,
                speaker_muted: false,
                microphone: MicrophoneState::Idle,
            }),
            active: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn device_keys(&self) -> &DeviceKeys {
        &self.keys
    }

    pub fn set_transport(&self, transport: Arc<dyn TransportEvents>) {
        *self.transport.lock().unwrap() = Some(transport);
    }

    pub fn start(&self) -> crate::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("service starting");
        self.with_transport(|t| t.on_state_sync(StateSyncReason::Start));
        Ok(())
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.lock().unwrap()
    }

    pub fn register_command_listener(&self, listener: CommandListener) -> u64 {
        self.commands.register(listener)
    }

    pub fn unregister_command_listener(&self, id: u64) {
        self.commands.unregister(id);
    }

    pub fn register_status_listener(&self, listener: StatusListener) -> u64 {
        self.statuses.register(listener)
    }

    pub fn unregister_status_listener(&self, id: u64) {
        self.statuses.unregister(id);
    }

    pub fn register_tts_binary_listener(&self, listener: TtsBinaryListener) -> u64 {
        self.tts_binary.register(listener)
    }

    pub fn unregister_tts_binary_listener(&self, id: u64) {
        self.tts_binary.unregister(id);
    }

    fn with_transport(&self, f: impl FnOnce(&dyn TransportEvents)) {
        let transport = self.transport.lock().unwrap().clone();
        if let Some(t) = transport {
            f(t.as_ref());
        }
    }

    /// Inject a decoded cloud command (transport side).
    pub fn dispatch_command(&self, domain: Domain, command: Command, payload: &str) {
        debug!(?domain, ?command, "dispatching command");
        for listener in self.commands.snapshot() {
            listener(domain, command, payload);
        }
    }

    /// Publish a dialog status change and cache it.
    pub fn dispatch_status(&self, status: Status) {
        debug!(?status, "dispatching status");
        {
            let mut cached = self.status.lock().unwrap();
            match status {
                Status::NetworkConnected => cached.network_connected = true,
                Status::NetworkDisconnected => cached.network_connected = false,
                Status::GatewayConnected => cached.gateway_connected = true,
                Status::GatewayDisconnected => cached.gateway_connected = false,
                Status::Authorized => cached.authorized = true,
                Status::Unauthorized => cached.authorized = false,
                Status::SpeakerMuted => cached.speaker_muted = true,
                Status::SpeakerUnmuted => cached.speaker_muted = false,
                Status::MicphoneWakeup => cached.microphone = MicrophoneState::Wakeup,
                Status::MicphoneStarted => cached.microphone = MicrophoneState::Started,
                Status::MicphoneStopped => cached.microphone = MicrophoneState::Stopped,
            }
        }
        for listener in self.statuses.snapshot() {
            listener(status);
        }
    }

    /// Inject a streamed TTS frame (transport side).
    pub fn dispatch_tts_binary(&self, data: &[u8], final_frame: bool) {
        for listener in self.tts_binary.snapshot() {
            listener(data, final_frame);
        }
    }

    // --- the callback surface the core components invoke ---

    pub fn on_network_connected(&self) {
        self.dispatch_status(Status::NetworkConnected);
    }

    pub fn on_network_disconnected(&self) {
        self.dispatch_status(Status::NetworkDisconnected);
    }

    /// Wake word detected: broadcast the wakeup so the player schedules the
    /// wake prompt, and tell the cloud the microphone went active.
    pub fn on_micphone_wakeup(&self, wakeup_word: &str, doa: i32, confidence: f64) {
        info!(wakeup_word, doa, confidence, "wake word detected");
        self.with_transport(|t| t.on_microphone_active(MicrophoneActiveReason::User));
        self.dispatch_status(Status::MicphoneWakeup);
    }

    /// Voice activity ended: close the current listen turn.
    pub fn on_micphone_silence(&self) {
        debug!("silence detected");
        self.dispatch_command(Domain::Microphone, Command::ExpectSpeechStop, "{}");
    }

    /// The wake/record prompt finished: open the microphone.
    pub fn on_expect_speech(&self) {
        debug!("expect speech");
        self.dispatch_command(Domain::Microphone, Command::ExpectSpeechStart, "{}");
    }

    pub fn on_speaker_volume_changed(&self, volume: i32) {
        let muted = self.status.lock().unwrap().speaker_muted;
        self.with_transport(|t| {
            t.on_speaker_sync(
                SpeakerSyncReason::VolumeChanged,
                &SpeakerContext {
                    volume,
                    is_mute: muted,
                },
            )
        });
    }

    pub fn on_speaker_muted_changed(&self, muted: bool) {
        self.dispatch_status(if muted {
            Status::SpeakerMuted
        } else {
            Status::SpeakerUnmuted
        });
        self.with_transport(|t| {
            t.on_speaker_sync(
                SpeakerSyncReason::MutedChanged,
                &SpeakerContext {
                    volume: 0,
                    is_mute: muted,
                },
            )
        });
    }

    pub fn on_text_recognize(&self, text: &str) {
        info!(text, "text recognize request");
        self.with_transport(|t| t.on_text_recognize(text));
    }

    pub fn on_player_event(&self, reason: PlayerSyncReason) {
        self.with_transport(|t| t.on_player_sync(reason));
    }
}

impl SpeechSink for Service {
    /// Upload one captured frame; first/last frames also move the microphone
    /// status.
    fn on_speech_frame(&self, format: SpeechFormat, data: &[u8], final_frame: bool) {
        if !self.streaming.swap(true, Ordering::SeqCst) {
            self.with_transport(|t| {
                t.on_listen_started(&SpeechContext {
                    format: Some(format),
                    ..Default::default()
                })
            });
            self.dispatch_status(Status::MicphoneStarted);
        }
        self.with_transport(|t| t.on_speech_chunk(format, data, final_frame));
        if final_frame {
            self.streaming.store(false, Ordering::SeqCst);
            self.dispatch_status(Status::MicphoneStopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        chunks: Mutex<Vec<(usize, bool)>>,
        listen_started: AtomicBool,
        texts: Mutex<Vec<String>>,
        player_syncs: Mutex<Vec<PlayerSyncReason>>,
    }

    impl TransportEvents for RecordingTransport {
        fn on_listen_started(&self, _ctx: &SpeechContext) {
            self.listen_started.store(true, Ordering::SeqCst);
        }
        fn on_speech_chunk(&self, _format: SpeechFormat, data: &[u8], final_frame: bool) {
            self.chunks.lock().unwrap().push((data.len(), final_frame));
        }
        fn on_text_recognize(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }
        fn on_player_sync(&self, reason: PlayerSyncReason) {
            self.player_syncs.lock().unwrap().push(reason);
        }
    }

    fn service_with_transport() -> (Arc<Service>, Arc<RecordingTransport>) {
        let service = Arc::new(Service::new(DeviceKeys::default()));
        let transport = Arc::new(RecordingTransport::default());
        service.set_transport(transport.clone());
        (service, transport)
    }

    #[test]
    fn status_dispatch_updates_cache_and_listeners() {
        let (service, _t) = service_with_transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        service.register_status_listener(Arc::new(move |s| log.lock().unwrap().push(s)));

        service.dispatch_status(Status::NetworkConnected);
        service.dispatch_status(Status::GatewayConnected);
        service.dispatch_status(Status::Authorized);
        let status = service.status();
        assert!(status.network_connected && status.gateway_connected && status.authorized);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn unregister_stops_delivery() {
        let (service, _t) = service_with_transport();
        let seen = Arc::new(Mutex::new(0u32));
        let log = seen.clone();
        let id = service.register_command_listener(Arc::new(move |_d, _c, _p| {
            *log.lock().unwrap() += 1;
        }));
        service.dispatch_command(Domain::Audio, Command::Play, "{}");
        service.unregister_command_listener(id);
        service.dispatch_command(Domain::Audio, Command::Play, "{}");
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn wakeup_broadcasts_status() {
        let (service, _t) = service_with_transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        service.register_status_listener(Arc::new(move |s| log.lock().unwrap().push(s)));
        service.on_micphone_wakeup("hey talkbox", 90, 0.93);
        assert_eq!(seen.lock().unwrap().as_slice(), &[Status::MicphoneWakeup]);
        assert_eq!(service.status().microphone, MicrophoneState::Wakeup);
    }

    #[test]
    fn expect_speech_becomes_a_command() {
        let (service, _t) = service_with_transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        service.register_command_listener(Arc::new(move |d, c, _p| {
            log.lock().unwrap().push((d, c));
        }));
        service.on_expect_speech();
        service.on_micphone_silence();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                (Domain::Microphone, Command::ExpectSpeechStart),
                (Domain::Microphone, Command::ExpectSpeechStop),
            ]
        );
    }

    #[test]
    fn speech_frames_frame_the_microphone_status() {
        let (service, transport) = service_with_transport();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        service.register_status_listener(Arc::new(move |s| log.lock().unwrap().push(s)));

        service.on_speech_frame(SpeechFormat::Pcm, &[0u8; 960], false);
        service.on_speech_frame(SpeechFormat::Pcm, &[0u8; 960], false);
        service.on_speech_frame(SpeechFormat::Pcm, &[0u8; 960], true);

        assert!(transport.listen_started.load(Ordering::SeqCst));
        assert_eq!(transport.chunks.lock().unwrap().len(), 3);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Status::MicphoneStarted, Status::MicphoneStopped]
        );
    }

    #[test]
    fn player_events_reach_the_transport() {
        let (service, transport) = service_with_transport();
        service.on_player_event(PlayerSyncReason::Started);
        service.on_player_event(PlayerSyncReason::Finished);
        assert_eq!(
            transport.player_syncs.lock().unwrap().as_slice(),
            &[PlayerSyncReason::Started, PlayerSyncReason::Finished]
        );
    }
}
