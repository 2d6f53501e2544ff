// MIDI output worker
// Cooperatively wakes on a condition; each wake renders one read-ahead
// window of events into the queue, with loop wrap and drift checks

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::track::Track;

use super::EngineCore;

const JOIN_RETRY: Duration = Duration::from_millis(100);

pub(crate) struct OutputShared {
    core: Arc<EngineCore>,
    lock: Mutex<()>,
    cond: Condvar,
    run_state: AtomicBool,
    drift_check: AtomicU32,
}

pub(crate) struct OutputWorker {
    shared: Arc<OutputShared>,
    handle: Option<JoinHandle<()>>,
}

impl OutputWorker {
    pub fn spawn(core: Arc<EngineCore>) -> Self {
        let shared = Arc::new(OutputShared {
            core,
            lock: Mutex::new(()),
            cond: Condvar::new(),
            run_state: AtomicBool::new(true),
            drift_check: AtomicU32::new(0),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("seqcore-midi-out".into())
            .spawn(move || Self::run(thread_shared))
            .expect("spawn midi output thread");
        Self { shared, handle: Some(handle) }
    }

    fn run(shared: Arc<OutputShared>) {
        let mut guard = shared.lock.lock().unwrap();
        while shared.run_state.load(Ordering::Relaxed) {
            guard = shared.cond.wait(guard).unwrap();
            if !shared.run_state.load(Ordering::Relaxed) {
                break;
            }
            // Only if playing, the output process cycle
            if shared.core.session.is_playing() {
                Self::process(&shared);
            }
        }
    }

    /// One output process cycle
    fn process(shared: &OutputShared) {
        let core = &shared.core;

        // Isn't MIDI slightly ahead of audio? Bail out for this wake.
        if !core.midi_cursor_in_sync() {
            return;
        }

        let session = &core.session;
        let read_ahead = core.read_ahead();
        let mut frame_start = core.midi_cursor.frame();
        let mut frame_end = frame_start + read_ahead;

        // Split processing, in case we're looping
        if session.is_looping() && frame_start < session.loop_end() {
            // The loop length might be shorter than the read-ahead
            while frame_end >= session.loop_end() {
                let loop_end = session.loop_end();
                core.process_metro(frame_start, loop_end);
                core.render_range(frame_start, loop_end);
                frame_start = session.loop_start();
                frame_end = frame_start + (frame_end - loop_end);
                core.midi_cursor.seek(frame_start);
                // This one is really a must
                core.restart_loop();
            }
        }

        core.process_metro(frame_start, frame_end);
        core.render_range(frame_start, frame_end);

        // Window tail past the loop end without a full split
        if session.is_looping()
            && frame_start < session.loop_end()
            && frame_end >= session.loop_end()
        {
            frame_end = session.loop_start() + (frame_end - session.loop_end());
        }

        // Seat the cursor on the next window; critical for audio sync
        core.midi_cursor.seek(frame_end);
        core.midi_cursor.process(read_ahead);

        core.flush();

        // Queue drift stats, every 9th window
        if shared.drift_check.fetch_add(1, Ordering::Relaxed) >= 8 {
            core.drift();
            shared.drift_check.store(0, Ordering::Relaxed);
        }
    }

    /// Audio/MIDI cursor predicate; with `start` the MIDI cursor seats
    /// on the audio cursor
    pub fn midi_cursor_sync(&self, start: bool) -> bool {
        let core = &self.shared.core;
        if start {
            core.midi_cursor.seek(core.audio.session_cursor().frame());
            self.shared.drift_check.store(0, Ordering::Relaxed);
            return true;
        }
        core.midi_cursor_in_sync()
    }

    /// Non-blocking wake; a realtime caller must never deadlock here,
    /// a missed wake is caught up by the next window
    pub fn sync(&self) {
        match self.shared.lock.try_lock() {
            Ok(_guard) => self.shared.cond.notify_all(),
            Err(_) => {
                #[cfg(debug_assertions)]
                eprintln!("seqcore: output sync() missed (busy)");
            }
        }
    }

    /// One process cycle, on the caller's thread, under the mutex
    pub fn process_sync(&self) {
        let _guard = self.shared.lock.lock().unwrap();
        Self::process(&self.shared);
    }

    /// Re-render one track from `frame_start` up to the MIDI cursor
    ///
    /// When the cursor already wrapped around the loop, the pre-wrap
    /// remainder renders with the queue origin shifted one loop length
    /// forward before the post-wrap range follows.
    pub fn track_sync(&self, track: &Track, frame_start: u64) {
        let _guard = self.shared.lock.lock().unwrap();
        let core = &self.shared.core;
        let session = &core.session;

        let mut frame_start = frame_start;
        let frame_end = core.midi_cursor.frame();

        if session.is_looping() && frame_end < frame_start {
            let loop_start = session.loop_start();
            let loop_end = session.loop_end();
            if frame_start < loop_end {
                let time_start = core.time_start();
                let loop_ticks = session.tick_from_frame(loop_end) as i64
                    - session.tick_from_frame(loop_start) as i64;
                core.set_time_start(time_start + loop_ticks);
                core.render_track_range(track, frame_start, loop_end);
                core.set_time_start(time_start);
                frame_start = loop_start;
            }
        }

        core.render_track_range(track, frame_start, frame_end);
        core.flush();
    }

    /// Re-render the metronome from `frame_start` up to the MIDI cursor
    pub fn metro_sync(&self, frame_start: u64) {
        let _guard = self.shared.lock.lock().unwrap();
        let core = &self.shared.core;
        core.process_metro(frame_start, core.midi_cursor.frame());
        core.flush();
    }

    pub fn set_read_ahead(&self, frames: u64) {
        let _guard = self.shared.lock.lock().unwrap();
        self.shared.core.read_ahead.store(frames, Ordering::Relaxed);
    }

    /// Cooperative teardown: flip the flag, poke the condition, wait
    pub fn shutdown(mut self) {
        self.shared.run_state.store(false, Ordering::Relaxed);
        self.sync();
        if let Some(handle) = self.handle.take() {
            while !handle.is_finished() {
                self.sync();
                thread::sleep(JOIN_RETRY);
            }
            let _ = handle.join();
        }
    }
}

impl Drop for OutputWorker {
    fn drop(&mut self) {
        self.shared.run_state.store(false, Ordering::Relaxed);
        self.sync();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
