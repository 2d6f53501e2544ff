// Session context
// Transport state, tempo map and track arena shared by the workers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::timescale::TimeScale;
use crate::track::{Track, TrackId};

/// Strip a name down to sequencer-safe characters
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '/' { c } else { '_' })
        .collect()
}

/// Shared transport flags and positions
/// Written by the host transport, read by both workers
#[derive(Debug, Default)]
struct TransportState {
    playing: AtomicBool,
    recording: AtomicBool,
    looping: AtomicBool,
    punching: AtomicBool,
    playhead: AtomicU64,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    punch_in: AtomicU64,
    punch_out: AtomicU64,
}

/// The engine-facing session object
///
/// One explicit context threaded through the workers; owns the tempo
/// map behind a read/write lock and the tracks as an arena of shared
/// handles.
pub struct Session {
    client_name: String,
    timescale: RwLock<TimeScale>,
    transport: TransportState,
    tracks: RwLock<Vec<Arc<Track>>>,
}

impl Session {
    pub fn new(client_name: &str, sample_rate: u32, ticks_per_beat: u32) -> Self {
        Self {
            client_name: client_name.to_string(),
            timescale: RwLock::new(TimeScale::new(sample_rate, ticks_per_beat)),
            transport: TransportState::default(),
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.timescale.read().unwrap().sample_rate()
    }

    pub fn ticks_per_beat(&self) -> u32 {
        self.timescale.read().unwrap().ticks_per_beat()
    }

    /// Read access to the tempo map
    pub fn with_timescale<R>(&self, f: impl FnOnce(&TimeScale) -> R) -> R {
        f(&self.timescale.read().unwrap())
    }

    /// Edit the tempo map (stopped-transport operation)
    pub fn edit_timescale<R>(&self, f: impl FnOnce(&mut TimeScale) -> R) -> R {
        f(&mut self.timescale.write().unwrap())
    }

    pub fn tick_from_frame(&self, frame: u64) -> u64 {
        self.timescale.read().unwrap().tick_from_frame(frame)
    }

    pub fn frame_from_tick(&self, tick: u64) -> u64 {
        self.timescale.read().unwrap().frame_from_tick(tick)
    }

    // --- transport -------------------------------------------------------

    pub fn is_playing(&self) -> bool {
        self.transport.playing.load(Ordering::Relaxed)
    }

    pub fn set_playing(&self, on: bool) {
        self.transport.playing.store(on, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.transport.recording.load(Ordering::Relaxed)
    }

    pub fn set_recording(&self, on: bool) {
        self.transport.recording.store(on, Ordering::Relaxed);
    }

    pub fn is_looping(&self) -> bool {
        self.transport.looping.load(Ordering::Relaxed)
    }

    pub fn loop_start(&self) -> u64 {
        self.transport.loop_start.load(Ordering::Relaxed)
    }

    pub fn loop_end(&self) -> u64 {
        self.transport.loop_end.load(Ordering::Relaxed)
    }

    pub fn set_loop(&self, start: u64, end: u64) {
        if end > start {
            self.transport.loop_start.store(start, Ordering::Relaxed);
            self.transport.loop_end.store(end, Ordering::Relaxed);
            self.transport.looping.store(true, Ordering::Relaxed);
        } else {
            self.transport.looping.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_punching(&self) -> bool {
        self.transport.punching.load(Ordering::Relaxed)
    }

    pub fn punch_in(&self) -> u64 {
        self.transport.punch_in.load(Ordering::Relaxed)
    }

    pub fn punch_out(&self) -> u64 {
        self.transport.punch_out.load(Ordering::Relaxed)
    }

    pub fn set_punch(&self, punch_in: u64, punch_out: u64) {
        if punch_out > punch_in {
            self.transport.punch_in.store(punch_in, Ordering::Relaxed);
            self.transport.punch_out.store(punch_out, Ordering::Relaxed);
            self.transport.punching.store(true, Ordering::Relaxed);
        } else {
            self.transport.punching.store(false, Ordering::Relaxed);
        }
    }

    pub fn play_head(&self) -> u64 {
        self.transport.playhead.load(Ordering::Relaxed)
    }

    pub fn set_play_head(&self, frame: u64) {
        self.transport.playhead.store(frame, Ordering::Relaxed);
    }

    // --- tracks ----------------------------------------------------------

    pub fn add_track(&self, track: Track) -> Arc<Track> {
        let track = Arc::new(track);
        self.tracks.write().unwrap().push(track.clone());
        track
    }

    pub fn tracks(&self) -> RwLockReadGuard<'_, Vec<Arc<Track>>> {
        self.tracks.read().unwrap()
    }

    pub fn track(&self, id: TrackId) -> Option<Arc<Track>> {
        self.tracks.read().unwrap().iter().find(|t| t.id == id).cloned()
    }

    /// Whether any track is soloed (solo filtering active)
    pub fn solo_tracks(&self) -> bool {
        self.tracks.read().unwrap().iter().any(|t| t.is_solo())
    }

    /// Whether a track should mirror its input to its output bus
    pub fn is_track_monitor(&self, track: &Track) -> bool {
        track.is_monitor()
    }

    /// Whether `channel` addresses this track
    pub fn is_track_midi_channel(&self, track: &Track, channel: u8) -> bool {
        track.channel == (channel & 0x0f)
    }

    /// Cooperative breather for long stopped-transport sweeps
    pub fn stabilize(&self) {
        std::thread::yield_now();
    }
}
