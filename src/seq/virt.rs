// In-memory sequencer backend
// Deterministic queue used by the test suites and by hosts that have no
// system sequencer to bind to

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::seq::{
    caps, Addr, ClientId, PortChange, PortId, PortInfo, RemoveSpec, SeqEvent, SeqEventKind,
    Sequencer, SubsDir,
};

const SKEW_BASE: u32 = 0x10000;

#[derive(Debug, Clone)]
struct PortRecord {
    name: String,
    caps: u32,
    tick_stamping: bool,
}

#[derive(Debug, Default)]
struct Inner {
    next_port: PortId,
    ports: HashMap<PortId, PortRecord>,
    remotes: Vec<PortInfo>,
    subs: Vec<(Addr, Addr)>,
    input: VecDeque<SeqEvent>,
    announce: VecDeque<PortChange>,
    pending: Vec<SeqEvent>,
    delivered: Vec<SeqEvent>,
    queue_running: bool,
    tick_time: u64,
    ppq: u32,
    micros_per_beat: u32,
    skew: u32,
}

/// Virtual duplex client with one queue
pub struct VirtualSequencer {
    client: ClientId,
    client_name: String,
    inner: Mutex<Inner>,
    input_cv: Condvar,
}

impl VirtualSequencer {
    pub fn new(client_name: &str) -> Self {
        Self {
            client: 128,
            client_name: client_name.to_string(),
            inner: Mutex::new(Inner {
                ppq: 960,
                micros_per_beat: 500_000,
                skew: SKEW_BASE,
                ..Inner::default()
            }),
            input_cv: Condvar::new(),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Register a fake external endpoint for connection tests
    pub fn add_remote(&self, client: ClientId, port: PortId, client_name: &str, port_name: &str, caps: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.remotes.push(PortInfo {
            client,
            port,
            client_name: client_name.to_string(),
            port_name: port_name.to_string(),
            caps,
        });
    }

    /// Inject an input event, waking any poller
    pub fn push_input(&self, ev: SeqEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.input.push_back(ev);
        self.input_cv.notify_all();
    }

    /// Inject a port-graph announcement, waking any poller
    pub fn push_announce(&self, change: PortChange) {
        let mut inner = self.inner.lock().unwrap();
        inner.announce.push_back(change);
        self.input_cv.notify_all();
    }

    /// Advance the queue clock (only while the queue runs)
    pub fn advance_ticks(&self, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue_running {
            inner.tick_time += delta;
        }
    }

    /// Drained (delivered) output events, in schedule order
    pub fn take_delivered(&self) -> Vec<SeqEvent> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.delivered)
    }

    pub fn delivered_len(&self) -> usize {
        self.inner.lock().unwrap().delivered.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn queue_tempo(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.ppq, inner.micros_per_beat)
    }

    pub fn subscriptions(&self) -> Vec<(Addr, Addr)> {
        self.inner.lock().unwrap().subs.clone()
    }

    fn port_info(&self, inner: &Inner, port: PortId) -> Option<PortInfo> {
        inner.ports.get(&port).map(|rec| PortInfo {
            client: self.client,
            port,
            client_name: self.client_name.clone(),
            port_name: rec.name.clone(),
            caps: rec.caps,
        })
    }
}

impl Sequencer for VirtualSequencer {
    fn client_id(&self) -> ClientId {
        self.client
    }

    fn create_port(&self, name: &str, port_caps: u32) -> EngineResult<PortId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ports.values().any(|rec| rec.name == name) {
            return Err(EngineError::PortCreate(name.to_string()));
        }
        let port = inner.next_port;
        inner.next_port += 1;
        inner.ports.insert(
            port,
            PortRecord {
                name: name.to_string(),
                caps: port_caps,
                tick_stamping: false,
            },
        );
        inner.announce.push_back(PortChange::PortStart { client: self.client, port });
        self.input_cv.notify_all();
        Ok(port)
    }

    fn delete_port(&self, port: PortId) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ports.remove(&port).ok_or_else(|| {
            EngineError::Backend(format!("no such port: {}", port))
        })?;
        inner.subs.retain(|(s, d)| {
            !(s.client == self.client && s.port == port)
                && !(d.client == self.client && d.port == port)
        });
        inner.announce.push_back(PortChange::PortExit { client: self.client, port });
        self.input_cv.notify_all();
        Ok(())
    }

    fn set_tick_stamping(&self, port: PortId) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.ports.get_mut(&port) {
            Some(rec) => {
                rec.tick_stamping = true;
                Ok(())
            }
            None => Err(EngineError::Backend(format!("no such port: {}", port))),
        }
    }

    fn subscribe(&self, sender: Addr, dest: Addr) -> EngineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let known = |addr: Addr, inner: &Inner| {
            (addr.client == self.client && inner.ports.contains_key(&addr.port))
                || inner
                    .remotes
                    .iter()
                    .any(|r| r.client == addr.client && r.port == addr.port)
        };
        if !known(sender, &inner) || !known(dest, &inner) {
            return Err(EngineError::Backend("unknown subscription endpoint".into()));
        }
        if !inner.subs.contains(&(sender, dest)) {
            inner.subs.push((sender, dest));
            inner.announce.push_back(PortChange::Subscribed { sender, dest });
            self.input_cv.notify_all();
        }
        Ok(())
    }

    fn query_subscriptions(&self, port: PortId, dir: SubsDir) -> Vec<PortInfo> {
        let inner = self.inner.lock().unwrap();
        let me = Addr::new(self.client, port);
        inner
            .subs
            .iter()
            .filter_map(|(sender, dest)| match dir {
                SubsDir::Read if *sender == me => Some(*dest),
                SubsDir::Write if *dest == me => Some(*sender),
                _ => None,
            })
            .filter_map(|addr| {
                if addr.client == self.client {
                    self.port_info(&inner, addr.port)
                } else {
                    inner
                        .remotes
                        .iter()
                        .find(|r| r.client == addr.client && r.port == addr.port)
                        .cloned()
                }
            })
            .collect()
    }

    fn list_endpoints(&self, want: u32) -> Vec<PortInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .remotes
            .iter()
            .cloned()
            .chain(inner.ports.keys().filter_map(|p| self.port_info(&inner, *p)))
            .filter(|info| info.caps & want == want && info.caps & caps::NO_EXPORT == 0)
            .collect()
    }

    fn event_output(&self, ev: SeqEvent) {
        let mut inner = self.inner.lock().unwrap();
        if ev.direct {
            inner.delivered.push(ev);
        } else {
            inner.pending.push(ev);
        }
    }

    fn event_output_direct(&self, mut ev: SeqEvent) {
        ev.direct = true;
        let mut inner = self.inner.lock().unwrap();
        inner.delivered.push(ev);
    }

    fn drain_output(&self) {
        let mut inner = self.inner.lock().unwrap();
        // The backend delivers in schedule order, not enqueue order
        let mut pending = std::mem::take(&mut inner.pending);
        pending.sort_by_key(|ev| ev.tick);
        inner.delivered.extend(pending);
    }

    fn drop_output(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.clear();
    }

    fn drop_input(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.input.clear();
    }

    fn remove_output_events(&self, spec: &RemoveSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.retain(|ev| !spec.matches(ev));
    }

    fn set_queue_tempo(&self, ppq: u32, micros_per_beat: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.ppq = ppq;
        inner.micros_per_beat = micros_per_beat;
    }

    fn set_queue_skew(&self, skew: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.skew = skew;
    }

    fn queue_skew(&self) -> u32 {
        self.inner.lock().unwrap().skew
    }

    fn queue_skew_base(&self) -> u32 {
        SKEW_BASE
    }

    fn queue_tick_time(&self) -> u64 {
        self.inner.lock().unwrap().tick_time
    }

    fn start_queue(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue_running = true;
        inner.tick_time = 0;
    }

    fn stop_queue(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue_running = false;
    }

    fn poll_input(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.input.is_empty() || !inner.announce.is_empty() {
            return true;
        }
        let (inner, _timed_out) = self.input_cv.wait_timeout(inner, timeout).unwrap();
        !inner.input.is_empty() || !inner.announce.is_empty()
    }

    fn event_input(&self) -> Option<SeqEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner.input.pop_front()
    }

    fn input_pending(&self) -> usize {
        self.inner.lock().unwrap().input.len()
    }

    fn poll_announce(&self) -> Option<PortChange> {
        let mut inner = self.inner.lock().unwrap();
        inner.announce.pop_front()
    }
}
