//! Cloud dialog protocol: domains, commands, statuses, error codes, and the
//! JSON payloads that ride along with commands.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Account,
    System,
    Microphone,
    Speaker,
    Text,
    Audio,
    SystemControl,
    DotMatrixDisplay,
    Network,
    Light,
    Data,
    Alarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Account
    GuestDeviceActivateResp,
    MemberDeviceActivateResp,
    UserInfoResp,
    // Microphone
    StopListen,
    ExpectSpeechStart,
    ExpectSpeechStop,
    // Speaker
    Speak,
    SetVolume,
    AdjustVolume,
    SetMute,
    // Text
    ListenResult,
    // Audio
    Play,
    PlayOnce,
    ClearQueue,
    // DotMatrixDisplay
    Render,
    // Light
    Adjust,
    // Data
    DataSync,
    // Alarm
    Set,
    // Network
    NetworkConfig,
    // System
    Setting,
    ThrowException,
    Success,
    // System.Control
    Pause,
    Resume,
    Exit,
    Standby,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NetworkDisconnected,
    NetworkConnected,
    GatewayDisconnected,
    GatewayConnected,
    Unauthorized,
    Authorized,
    SpeakerUnmuted,
    SpeakerMuted,
    MicphoneWakeup,
    MicphoneStarted,
    MicphoneStopped,
}

/// Service-level error codes surfaced through state callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    General = -1,
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    ThrottlingException = 429,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    AsrRecognizeError = 600,
    NluExecuteError = 601,
    TtsSynthesizeError = 602,
    AuthCodeNotValid = 603,
    NluNotUnderstandSpeech = 604,
    Success = 100_000,
}

/// Upload wire format for captured speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechFormat {
    /// 16 kHz / 16-bit / mono little-endian PCM in 30 ms frames.
    Pcm,
    /// Speex narrowband in Ogg pages. The variant is part of the wire contract;
    /// this build ships only the PCM encoder.
    SpeexOgg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerSource {
    None,
    Cloud,
    Bluetooth,
}

/// Playback metadata synced to the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerContext {
    pub audio_url: String,
    pub audio_id: String,
    pub audio_name: String,
    pub audio_album: String,
    pub audio_source: String,
    pub progress: i32,
    pub audio_length: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakerContext {
    pub volume: i32,
    pub is_mute: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SpeechContext {
    pub format: Option<SpeechFormat>,
    pub wakeup_word: String,
    pub doa: i32,
    pub confidence: f64,
}

/// `Speak` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakPayload {
    pub expect_speech: bool,
}

/// `Play` / `PlayOnce` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayPayload {
    pub audio_url: Option<String>,
}

/// `Volume` / `SetVolume` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumePayload {
    pub volume_value: Option<i32>,
}

pub fn parse_speak(payload: &str) -> Option<SpeakPayload> {
    serde_json::from_str(payload).ok()
}

pub fn parse_play(payload: &str) -> Option<PlayPayload> {
    serde_json::from_str(payload).ok()
}

pub fn parse_volume(payload: &str) -> Option<VolumePayload> {
    serde_json::from_str(payload).ok()
}

/// Why a state sync is being sent to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSyncReason {
    Start,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerSyncReason {
    VolumeChanged,
    MutedChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerSyncReason {
    Started,
    Paused,
    Resumed,
    NearlyFinished,
    Finished,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneActiveReason {
    User,
    Server,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_speak_payload() {
        let p = parse_speak(r#"{"expectSpeech": true, "text": "hello"}"#).unwrap();
        assert!(p.expect_speech);
        let p = parse_speak(r#"{}"#).unwrap();
        assert!(!p.expect_speech);
        assert!(parse_speak("not json").is_none());
    }

    #[test]
    fn parses_play_payload() {
        let p = parse_play(r#"{"audioUrl": "http://cdn/x.mp3", "audioName": "x"}"#).unwrap();
        assert_eq!(p.audio_url.as_deref(), Some("http://cdn/x.mp3"));
        assert!(parse_play(r#"{}"#).unwrap().audio_url.is_none());
    }

    #[test]
    fn parses_volume_payload() {
        let p = parse_volume(r#"{"volumeValue": 35}"#).unwrap();
        assert_eq!(p.volume_value, Some(35));
    }

    #[test]
    fn error_codes_carry_wire_values() {
        assert_eq!(ErrorCode::Unauthorized as i32, 401);
        assert_eq!(ErrorCode::TtsSynthesizeError as i32, 602);
        assert_eq!(ErrorCode::Success as i32, 100_000);
    }
}
