// MIDI input worker
// Blocks on the backend's input descriptors and drains every pending
// event through the capture pipeline

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ringbuf::traits::Producer;

use super::EngineCore;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const JOIN_RETRY: Duration = Duration::from_millis(100);

pub(crate) struct InputWorker {
    run_state: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputWorker {
    pub fn spawn(core: Arc<EngineCore>) -> Self {
        let run_state = Arc::new(AtomicBool::new(true));
        let run = run_state.clone();
        let handle = thread::Builder::new()
            .name("seqcore-midi-in".into())
            .spawn(move || Self::run(core, run))
            .expect("spawn midi input thread");
        Self { run_state, handle: Some(handle) }
    }

    fn run(core: Arc<EngineCore>, run_state: Arc<AtomicBool>) {
        while run_state.load(Ordering::Relaxed) {
            if core.seq.poll_input(POLL_TIMEOUT) {
                // Drain everything pending before the next poll
                while let Some(mut ev) = core.seq.event_input() {
                    core.capture(&mut ev);
                }
            }
            // Forward port-graph announcements to the host channel
            while let Some(change) = core.seq.poll_announce() {
                if let Some(tx) = core.graph_tx.lock().unwrap().as_mut() {
                    if tx.try_push(change).is_err() {
                        eprintln!("Warning: graph notify buffer full, change dropped");
                    }
                }
            }
        }
    }

    /// Cooperative teardown: flip the flag, then wait it out
    pub fn shutdown(mut self) {
        self.run_state.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            while !handle.is_finished() {
                thread::sleep(JOIN_RETRY);
            }
            let _ = handle.join();
        }
    }
}

impl Drop for InputWorker {
    fn drop(&mut self) {
        self.run_state.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
