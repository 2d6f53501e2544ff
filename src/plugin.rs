// MIDI plugin chain
// Ordered taps that see the same events a bus or track emits

use std::sync::Mutex;

use crate::seq::SeqEvent;

/// Anything that wants to observe the MIDI stream of a chain
///
/// `direct` carries unscheduled deliveries (thru, patch changes, direct
/// controllers); `queued` carries events as they are pushed onto the
/// sequencer queue.
pub trait MidiTap: Send {
    fn direct(&mut self, ev: &SeqEvent);
    fn queued(&mut self, ev: &SeqEvent);
}

/// Per-direction plugin chain of a bus or track
///
/// Plugin identities (names) are persisted with the document; live taps
/// are attached by the host at run time.
pub struct PluginChain {
    name: Mutex<String>,
    plugins: Mutex<Vec<String>>,
    taps: Mutex<Vec<Box<dyn MidiTap>>>,
}

impl PluginChain {
    pub fn new(name: &str) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            plugins: Mutex::new(Vec::new()),
            taps: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.lock().unwrap().clone()
    }

    pub fn set_plugin_names(&self, names: Vec<String>) {
        *self.plugins.lock().unwrap() = names;
    }

    pub fn add_tap(&self, tap: Box<dyn MidiTap>) {
        self.taps.lock().unwrap().push(tap);
    }

    pub fn direct(&self, ev: &SeqEvent) {
        for tap in self.taps.lock().unwrap().iter_mut() {
            tap.direct(ev);
        }
    }

    pub fn queued(&self, ev: &SeqEvent) {
        for tap in self.taps.lock().unwrap().iter_mut() {
            tap.queued(ev);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every event a chain sees, for assertions
    #[derive(Default)]
    pub struct RecordingTap {
        pub direct: Arc<Mutex<Vec<SeqEvent>>>,
        pub queued: Arc<Mutex<Vec<SeqEvent>>>,
    }

    impl MidiTap for RecordingTap {
        fn direct(&mut self, ev: &SeqEvent) {
            self.direct.lock().unwrap().push(ev.clone());
        }
        fn queued(&mut self, ev: &SeqEvent) {
            self.queued.lock().unwrap().push(ev.clone());
        }
    }
}
