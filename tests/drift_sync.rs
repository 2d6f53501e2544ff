//! Audio/MIDI drift correction behavior: the queue skew warps the
//! future clock rate, never the already-enqueued events.

use std::sync::Arc;

use seqcore::bus::{BusMode, MidiBus};
use seqcore::seq::Sequencer;
use seqcore::{AudioEngine, MidiEngine, Session, VirtualSequencer};

const READ_AHEAD: u64 = 24000;

fn running_engine() -> (Arc<VirtualSequencer>, Arc<Session>, Arc<AudioEngine>, MidiEngine) {
    let seq = Arc::new(VirtualSequencer::new("seqcore-drift"));
    let session = Arc::new(Session::new("seqcore-drift", 48000, 960));
    let audio = Arc::new(AudioEngine::new(48000, 512));
    let mut engine = MidiEngine::new(seq.clone(), session.clone(), audio.clone());

    engine.init().unwrap();
    engine.add_bus(MidiBus::new("Master", BusMode::Duplex, false)).unwrap();
    engine.activate().unwrap();
    engine.set_read_ahead(READ_AHEAD);
    session.set_playing(true);
    engine.start().unwrap();
    (seq, session, audio, engine)
}

/// Run enough output windows for the periodic drift check to fire,
/// keeping the audio clock moving so no window gets skipped
fn run_windows(engine: &MidiEngine, audio: &AudioEngine, count: usize) {
    for _ in 0..count {
        audio.session_cursor().advance(READ_AHEAD);
        engine.process_sync();
    }
}

#[test]
fn test_drift_correction_skews_queue() {
    let (seq, session, audio, engine) = running_engine();
    let base = seq.queue_skew_base();
    assert_eq!(seq.queue_skew(), base);

    // Audio reaches beat 4 while the queue clock lags at 3500 ticks
    session.set_play_head(96000);
    seq.advance_ticks(3500);

    // The first window ran inside start(); eight more reach the check
    run_windows(&engine, &audio, 8);

    // skew' = base * 3840 / 3500, drift accumulates the 340-tick delta
    let expected = (base as f64 * 3840.0 / 3500.0) as u32;
    assert_eq!(seq.queue_skew(), expected);
    assert!(seq.queue_skew() > base);
    assert_eq!(engine.time_drift(), 340);
}

#[test]
fn test_drift_out_of_range_is_skipped() {
    let (seq, session, audio, engine) = running_engine();
    let base = seq.queue_skew_base();

    // Queue barely moved: the delta exceeds the read-ahead window and
    // no corrective skew is applied
    session.set_play_head(96000);
    seq.advance_ticks(100);
    run_windows(&engine, &audio, 8);

    assert_eq!(seq.queue_skew(), base);
    assert_eq!(engine.time_drift(), 0);
}

#[test]
fn test_drift_correction_accumulates() {
    let (seq, session, audio, engine) = running_engine();

    session.set_play_head(96000);
    seq.advance_ticks(3500);
    run_windows(&engine, &audio, 8);
    assert_eq!(engine.time_drift(), 340);
    let first_skew = seq.queue_skew();

    // Next round: the gap narrows, drift keeps integrating the residual
    session.set_play_head(192000);
    seq.advance_ticks(7460 - 3500);
    run_windows(&engine, &audio, 9);

    assert_eq!(engine.time_drift(), 340 + 220);
    assert_ne!(seq.queue_skew(), first_skew);
}

#[test]
fn test_restart_loop_rewinds_origin_and_zeroes_drift() {
    // A 5-second loop; drift accrues inside it, then the wrap resets
    // the integrator and rewinds the queue origin by one loop length
    let seq = Arc::new(VirtualSequencer::new("seqcore-drift"));
    let session = Arc::new(Session::new("seqcore-drift", 48000, 960));
    let audio = Arc::new(AudioEngine::new(48000, 512));
    let mut engine = MidiEngine::new(seq.clone(), session.clone(), audio.clone());

    engine.init().unwrap();
    engine.add_bus(MidiBus::new("Master", BusMode::Duplex, false)).unwrap();
    session.set_loop(0, 240000);
    engine.activate().unwrap();
    engine.set_read_ahead(READ_AHEAD);
    session.set_playing(true);
    engine.start().unwrap();

    session.set_play_head(96000);
    seq.advance_ticks(3500);
    run_windows(&engine, &audio, 8);
    assert_eq!(engine.time_drift(), 340);

    // The next window crosses the loop end
    run_windows(&engine, &audio, 1);
    assert_eq!(engine.time_drift(), 0);
    assert_eq!(engine.time_start(), -9600);
}
