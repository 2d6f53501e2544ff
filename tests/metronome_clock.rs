//! Metronome click and MIDI-clock generation inside output windows.

use std::sync::Arc;

use seqcore::bus::{BusMode, MidiBus};
use seqcore::seq::{SeqEvent, SeqEventKind};
use seqcore::{AudioEngine, MidiEngine, Sequencer, Session, VirtualSequencer};

/// 120 BPM, 960 ppq at 48 kHz; read-ahead of one 4/4 bar
fn metro_engine() -> (Arc<VirtualSequencer>, Arc<Session>, MidiEngine) {
    let seq = Arc::new(VirtualSequencer::new("seqcore-metro"));
    let session = Arc::new(Session::new("seqcore-metro", 48000, 960));
    let audio = Arc::new(AudioEngine::new(48000, 512));
    let mut engine = MidiEngine::new(seq.clone(), session.clone(), audio);

    engine.init().unwrap();
    engine.add_bus(MidiBus::new("Master", BusMode::Duplex, false)).unwrap();
    engine.set_metro_bus(true).unwrap();
    engine.set_metronome(true);
    engine.activate().unwrap();
    engine.set_read_ahead(96000);
    (seq, session, engine)
}

fn notes(events: &[SeqEvent]) -> Vec<(u64, u8, u8)> {
    events
        .iter()
        .filter_map(|ev| match ev.kind {
            SeqEventKind::NoteOn { note, velocity, .. } => Some((ev.tick, note, velocity)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_metronome_beats_per_bar() {
    // One bar window: bar note on the downbeat, beat notes on the rest
    let (seq, session, engine) = metro_engine();
    session.set_playing(true);
    engine.start().unwrap();

    let clicks = notes(&seq.take_delivered());
    assert_eq!(clicks.len(), 4);
    assert_eq!(clicks[0], (0, 76, 96));
    assert_eq!(clicks[1], (960, 77, 64));
    assert_eq!(clicks[2], (1920, 77, 64));
    assert_eq!(clicks[3], (2880, 77, 64));
}

#[test]
fn test_metronome_follows_meter() {
    // 3/4 bars: the accent comes back every three beats
    let (seq, session, engine) = metro_engine();
    session.edit_timescale(|ts| ts.add_node(0, 120.0, 3));
    session.set_playing(true);
    engine.start().unwrap();

    let clicks = notes(&seq.take_delivered());
    assert_eq!(clicks.len(), 4);
    assert_eq!(clicks[0].1, 76);
    assert_eq!(clicks[1].1, 77);
    assert_eq!(clicks[2].1, 77);
    assert_eq!(clicks[3].1, 76); // beat 3 opens the second bar
}

#[test]
fn test_clock_run_24_per_beat() {
    let (seq, session, engine) = metro_engine();
    // The active engine opens the dedicated control bus right away
    engine.set_control_bus(true).unwrap();
    engine.set_clock_mode(BusMode::Output);
    session.set_playing(true);
    engine.start().unwrap();

    let events = seq.take_delivered();
    let clock_ticks: Vec<u64> = events
        .iter()
        .filter(|ev| matches!(ev.kind, SeqEventKind::Clock))
        .map(|ev| ev.tick)
        .collect();

    // 4 beats, 24 pulses each, at 960/24 = 40-tick spacing
    assert_eq!(clock_ticks.len(), 96);
    assert!(clock_ticks.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(clock_ticks[0], 0);
    assert_eq!(clock_ticks[1], 40);
    assert_eq!(clock_ticks[24], 960);
}

#[test]
fn test_tempo_change_enqueues_queue_tempo_event() {
    let (seq, session, engine) = metro_engine();
    // Double tempo from bar 2 (beat 4)
    session.edit_timescale(|ts| ts.add_node(4, 240.0, 4));
    session.set_playing(true);
    engine.start().unwrap();

    let events = seq.take_delivered();
    let tempo: Vec<&SeqEvent> = events
        .iter()
        .filter(|ev| matches!(ev.kind, SeqEventKind::Tempo { .. }))
        .collect();
    assert_eq!(tempo.len(), 1);
    assert_eq!(tempo[0].tick, 3840);
    assert_eq!(tempo[0].kind, SeqEventKind::Tempo { micros_per_beat: 250_000 });
}

#[test]
fn test_metronome_silent_when_disabled() {
    let (seq, session, engine) = metro_engine();
    engine.set_metronome(false);
    session.set_playing(true);
    engine.start().unwrap();

    assert!(notes(&seq.take_delivered()).is_empty());
}

#[test]
fn test_metro_mute_purges_pending_clicks() {
    let (seq, session, engine) = metro_engine();
    session.set_playing(true);
    engine.start().unwrap();
    seq.take_delivered();

    // Queue more clicks without draining, then mute mid-play
    engine.metro_sync(0);
    seq.take_delivered();
    let port = engine.metro_bus().unwrap().port().unwrap();
    seq.event_output({
        let mut ev = seqcore::seq::SeqEvent::queued(
            SeqEventKind::NoteOn { note: 77, velocity: 64, duration: 24 },
            9,
            port,
            5000,
        );
        ev.tag = 0xff;
        ev
    });
    assert_eq!(seq.pending_len(), 1);

    engine.set_metronome(false);
    assert_eq!(seq.pending_len(), 0);
}

#[test]
fn test_metro_beat_parameters_are_beat_fields() {
    let (_seq, _session, engine) = metro_engine();
    engine.set_metro_bar(75, 110, 60);
    engine.set_metro_beat(70, 50, 20);

    assert_eq!(engine.metro_bar_note(), 75);
    assert_eq!(engine.metro_bar_velocity(), 110);
    assert_eq!(engine.metro_bar_duration(), 60);
    // The beat accessors report the beat parameters, not the bar's
    assert_eq!(engine.metro_beat_note(), 70);
    assert_eq!(engine.metro_beat_velocity(), 50);
    assert_eq!(engine.metro_beat_duration(), 20);
}
