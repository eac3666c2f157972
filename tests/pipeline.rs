//! End-to-end playback through the real pipeline: prebuilt source → media
//! parser → decoder element → PCM sink.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use talkbox::player::{Player, PlayerState};
use talkbox::sink::CollectSink;
use talkbox::source::memory::MemorySource;

/// Generate an in-memory WAV with hound, the way the firmware build bakes its
/// prompt tones.
fn wav_tone(seconds: f32, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let total = (seconds * sample_rate as f32) as u32;
        for t in 0..total {
            let phase = t as f32 / sample_rate as f32 * 440.0 * std::f32::consts::TAU;
            writer.write_sample((phase.sin() * 8000.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

struct Rig {
    player: Player,
    collected: Arc<Mutex<talkbox::sink::CollectState>>,
    states: Arc<Mutex<Vec<PlayerState>>>,
}

fn rig_with(url: &str, blob: Vec<u8>) -> Rig {
    let player = Player::new();
    let source = MemorySource::new("prebuilt");
    source.register(url, blob);
    player.register_source(Arc::new(source)).unwrap();

    let sink = CollectSink::new();
    let collected = sink.state();
    player.register_sink(Arc::new(sink)).unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let log = states.clone();
    player
        .set_state_listener(Arc::new(move |state, _err| {
            log.lock().unwrap().push(state);
        }))
        .unwrap();
    Rig {
        player,
        collected,
        states,
    }
}

fn wait_for(player: &Player, want: PlayerState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if player.state() == want {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("player stuck in {:?}, wanted {want:?}", player.state());
}

#[test]
fn wav_file_plays_to_completion_with_correct_duration() {
    let blob = wav_tone(1.0, 16000);
    let rig = rig_with("prebuilt://tone", blob);

    rig.player.set_data_source("prebuilt://tone").unwrap();
    rig.player.prepare_async().unwrap();
    wait_for(&rig.player, PlayerState::Prepared, Duration::from_millis(500));
    let duration = rig.player.duration_ms().unwrap();
    assert!((990..=1010).contains(&duration), "duration {duration}");

    rig.player.start().unwrap();
    wait_for(&rig.player, PlayerState::Started, Duration::from_millis(500));
    wait_for(&rig.player, PlayerState::Completed, Duration::from_secs(5));

    let collected = rig.collected.lock().unwrap();
    assert_eq!(collected.opens, vec![(16000, 1, 16)]);
    // All PCM reached the sink.
    assert_eq!(collected.data.len(), 32000);

    // Observable state sequence, in order.
    let states = rig.states.lock().unwrap();
    let ordered: Vec<_> = states
        .iter()
        .filter(|s| {
            matches!(
                s,
                PlayerState::Inited
                    | PlayerState::Prepared
                    | PlayerState::Started
                    | PlayerState::Completed
            )
        })
        .collect();
    assert_eq!(
        ordered,
        vec![
            &PlayerState::Inited,
            &PlayerState::Prepared,
            &PlayerState::Started,
            &PlayerState::Completed
        ]
    );
}

#[test]
fn position_is_monotone_and_lands_near_duration() {
    let rig = rig_with("prebuilt://tone", wav_tone(1.0, 16000));
    rig.player.set_data_source("prebuilt://tone").unwrap();
    rig.player.prepare().unwrap();
    rig.player.start().unwrap();

    let mut last = 0;
    while rig.player.state() == PlayerState::Started {
        let pos = rig.player.position_ms();
        assert!(pos >= last, "position regressed {pos} < {last}");
        last = pos;
        thread::sleep(Duration::from_millis(2));
    }
    wait_for(&rig.player, PlayerState::Completed, Duration::from_secs(5));
    let final_pos = rig.player.position_ms();
    assert!((950..=1050).contains(&final_pos), "final position {final_pos}");
}

#[test]
fn stop_and_reset_recover_to_idle_and_replay() {
    let rig = rig_with("prebuilt://tone", wav_tone(2.0, 16000));
    rig.player.set_data_source("prebuilt://tone").unwrap();
    rig.player.prepare().unwrap();
    rig.player.start().unwrap();
    thread::sleep(Duration::from_millis(10));

    rig.player.stop().unwrap();
    assert_eq!(rig.player.state(), PlayerState::Stopped);
    rig.player.reset().unwrap();
    assert_eq!(rig.player.state(), PlayerState::Idle);

    // Same instance, fresh session.
    rig.player.set_data_source("prebuilt://tone").unwrap();
    rig.player.prepare().unwrap();
    rig.player.start().unwrap();
    wait_for(&rig.player, PlayerState::Completed, Duration::from_secs(5));
}

#[test]
fn non_media_source_errors_and_only_terminal_states_follow() {
    let rig = rig_with("prebuilt://junk.bin", vec![0xB0u8; 8192]);
    rig.player.set_data_source("prebuilt://junk.bin").unwrap();
    assert!(rig.player.prepare_async().is_err());
    assert_eq!(rig.player.state(), PlayerState::Error);
    assert!(rig.player.start().is_err());

    rig.player.reset().unwrap();
    assert_eq!(rig.player.state(), PlayerState::Idle);

    let states = rig.states.lock().unwrap();
    let err_at = states
        .iter()
        .position(|s| *s == PlayerState::Error)
        .expect("error reported");
    assert!(
        states[err_at + 1..]
            .iter()
            .all(|s| matches!(s, PlayerState::Stopped | PlayerState::Idle)),
        "non-terminal state after error: {states:?}"
    );
}

#[test]
fn seek_lands_within_tolerance_of_target() {
    let rig = rig_with("prebuilt://tone", wav_tone(3.0, 16000));
    rig.player.set_data_source("prebuilt://tone").unwrap();
    rig.player.prepare().unwrap();
    rig.player.seek(2000).unwrap();
    assert_eq!(rig.player.state(), PlayerState::SeekCompleted);

    rig.player.start().unwrap();
    wait_for(&rig.player, PlayerState::Completed, Duration::from_secs(5));
    // Only the last second was decoded.
    let written = rig.collected.lock().unwrap().data.len();
    assert_eq!(written, 32000);
    assert!((2950..=3100).contains(&rig.player.position_ms()));
}
