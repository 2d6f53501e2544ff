// Port & bus layer
// Named duplex sequencer ports with monitors, plugin chains, patch maps
// and connection bookkeeping

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::event::cc;
use crate::monitor::MidiMonitor;
use crate::plugin::PluginChain;
use crate::seq::{caps, Addr, PortId, PortInfo, SeqEvent, SeqEventKind, Sequencer, SubsDir};

const PORT_NONE: u32 = u32::MAX;

/// Bus direction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    None,
    Input,
    Output,
    Duplex,
}

impl BusMode {
    pub fn has_input(&self) -> bool {
        matches!(self, BusMode::Input | BusMode::Duplex)
    }

    pub fn has_output(&self) -> bool {
        matches!(self, BusMode::Output | BusMode::Duplex)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BusMode::None => "none",
            BusMode::Input => "input",
            BusMode::Output => "output",
            BusMode::Duplex => "duplex",
        }
    }

    pub fn from_str(text: &str) -> Self {
        match text {
            "input" => BusMode::Input,
            "output" => BusMode::Output,
            "duplex" => BusMode::Duplex,
            _ => BusMode::None,
        }
    }
}

/// One remote endpoint in a connection list
///
/// Names are the durable identity; client/port ids get resolved against
/// the live sequencer graph just before connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectItem {
    pub client: Option<u32>,
    pub port: Option<u32>,
    pub client_name: String,
    pub port_name: String,
}

impl ConnectItem {
    pub fn named(client_name: &str, port_name: &str) -> Self {
        Self {
            client: None,
            port: None,
            client_name: client_name.to_string(),
            port_name: port_name.to_string(),
        }
    }

    pub fn matches(&self, info: &PortInfo) -> bool {
        self.client_name == info.client_name && self.port_name == info.port_name
    }
}

impl From<&PortInfo> for ConnectItem {
    fn from(info: &PortInfo) -> Self {
        Self {
            client: Some(info.client),
            port: Some(info.port),
            client_name: info.client_name.clone(),
            port_name: info.port_name.clone(),
        }
    }
}

pub type ConnectList = Vec<ConnectItem>;

/// Bank selection method of a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankSelMethod {
    MsbLsb,
    Msb,
    Lsb,
}

impl BankSelMethod {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => BankSelMethod::Msb,
            2 => BankSelMethod::Lsb,
            _ => BankSelMethod::MsbLsb,
        }
    }

    pub fn to_i32(self) -> i32 {
        match self {
            BankSelMethod::MsbLsb => 0,
            BankSelMethod::Msb => 1,
            BankSelMethod::Lsb => 2,
        }
    }
}

/// Channel instrument patch
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub instrument_name: String,
    pub bank_sel_method: BankSelMethod,
    pub bank: i32,
    pub prog: i32,
}

/// Named SysEx setup entry
#[derive(Debug, Clone, PartialEq)]
pub struct SysexItem {
    pub name: String,
    pub data: Vec<u8>,
}

/// A managed sequencer port set
///
/// A duplex bus runs both directions over one shared port. Monitors,
/// plugin chains and the output SysEx list exist per retained direction
/// and survive mode changes on the side that stays.
pub struct MidiBus {
    name: String,
    mode: Mutex<BusMode>,
    passthrough: AtomicBool,
    port: AtomicU32,
    monitor_in: Mutex<Option<Arc<MidiMonitor>>>,
    monitor_out: Mutex<Option<Arc<MidiMonitor>>>,
    plugins_in: Mutex<Option<Arc<PluginChain>>>,
    plugins_out: Mutex<Option<Arc<PluginChain>>>,
    sysex_list: Mutex<Option<Vec<SysexItem>>>,
    patches: Mutex<HashMap<u8, Patch>>,
    instrument_name: Mutex<String>,
    pending_inputs: Mutex<ConnectList>,
    pending_outputs: Mutex<ConnectList>,
}

impl MidiBus {
    pub fn new(name: &str, mode: BusMode, passthrough: bool) -> Self {
        let bus = Self {
            name: name.to_string(),
            mode: Mutex::new(mode),
            passthrough: AtomicBool::new(passthrough),
            port: AtomicU32::new(PORT_NONE),
            monitor_in: Mutex::new(None),
            monitor_out: Mutex::new(None),
            plugins_in: Mutex::new(None),
            plugins_out: Mutex::new(None),
            sysex_list: Mutex::new(None),
            patches: Mutex::new(HashMap::new()),
            instrument_name: Mutex::new(String::new()),
            pending_inputs: Mutex::new(ConnectList::new()),
            pending_outputs: Mutex::new(ConnectList::new()),
        };
        bus.alloc_mode_resources(mode);
        bus
    }

    fn alloc_mode_resources(&self, mode: BusMode) {
        if mode.has_input() {
            let mut monitor = self.monitor_in.lock().unwrap();
            if monitor.is_none() {
                *monitor = Some(Arc::new(MidiMonitor::new()));
            }
            let mut plugins = self.plugins_in.lock().unwrap();
            if plugins.is_none() {
                *plugins = Some(Arc::new(PluginChain::new(&format!("{} In", self.name))));
            }
        }
        if mode.has_output() {
            let mut monitor = self.monitor_out.lock().unwrap();
            if monitor.is_none() {
                *monitor = Some(Arc::new(MidiMonitor::new()));
            }
            let mut plugins = self.plugins_out.lock().unwrap();
            if plugins.is_none() {
                *plugins = Some(Arc::new(PluginChain::new(&format!("{} Out", self.name))));
            }
            let mut sysex = self.sysex_list.lock().unwrap();
            if sysex.is_none() {
                *sysex = Some(Vec::new());
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BusMode {
        *self.mode.lock().unwrap()
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    pub fn set_passthrough(&self, passthrough: bool) {
        self.passthrough.store(passthrough, Ordering::Relaxed);
    }

    /// The sequencer port, while open
    pub fn port(&self) -> Option<PortId> {
        match self.port.load(Ordering::Relaxed) {
            PORT_NONE => None,
            port => Some(port),
        }
    }

    pub fn monitor_in(&self) -> Option<Arc<MidiMonitor>> {
        self.monitor_in.lock().unwrap().clone()
    }

    pub fn monitor_out(&self) -> Option<Arc<MidiMonitor>> {
        self.monitor_out.lock().unwrap().clone()
    }

    pub fn plugins_in(&self) -> Option<Arc<PluginChain>> {
        self.plugins_in.lock().unwrap().clone()
    }

    pub fn plugins_out(&self) -> Option<Arc<PluginChain>> {
        self.plugins_out.lock().unwrap().clone()
    }

    pub fn instrument_name(&self) -> String {
        self.instrument_name.lock().unwrap().clone()
    }

    pub fn set_instrument_name(&self, name: &str) {
        *self.instrument_name.lock().unwrap() = name.to_string();
    }

    pub fn sysex_list(&self) -> Vec<SysexItem> {
        self.sysex_list.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn set_sysex_list(&self, items: Vec<SysexItem>) {
        let mut sysex = self.sysex_list.lock().unwrap();
        if sysex.is_some() {
            *sysex = Some(items);
        }
    }

    pub fn patches(&self) -> HashMap<u8, Patch> {
        self.patches.lock().unwrap().clone()
    }

    pub fn patch(&self, channel: u8) -> Option<Patch> {
        self.patches.lock().unwrap().get(&(channel & 0x0f)).cloned()
    }

    pub fn load_patches(&self, patches: HashMap<u8, Patch>) {
        *self.patches.lock().unwrap() = patches;
    }

    pub fn pending_inputs(&self) -> std::sync::MutexGuard<'_, ConnectList> {
        self.pending_inputs.lock().unwrap()
    }

    pub fn pending_outputs(&self) -> std::sync::MutexGuard<'_, ConnectList> {
        self.pending_outputs.lock().unwrap()
    }

    /// Register the bus port with the backend
    ///
    /// The very same port serves input and output on a duplex bus; the
    /// input side gets queue-tick stamping so captured events arrive
    /// with musical time attached.
    pub fn open(&self, seq: &dyn Sequencer) -> EngineResult<()> {
        let mode = self.mode();
        let mut flags = 0u32;
        if mode.has_input() {
            flags |= caps::WRITE | caps::SUBS_WRITE;
        }
        if mode.has_output() {
            flags |= caps::READ | caps::SUBS_READ;
        }
        if flags == 0 {
            return Err(EngineError::PortCreate(self.name.clone()));
        }

        let port = seq.create_port(&self.name, flags)?;
        if mode.has_input() {
            seq.set_tick_stamping(port)?;
        }
        self.port.store(port, Ordering::Relaxed);
        Ok(())
    }

    /// Shut off and destroy the bus port
    pub fn close(&self, seq: &dyn Sequencer) {
        let Some(port) = self.port() else { return };
        self.shut_off_ex(seq, true);
        let _ = seq.delete_port(port);
        self.port.store(PORT_NONE, Ordering::Relaxed);
    }

    /// All-Sound-Off / All-Notes-Off sweep over every patched channel;
    /// All-Controllers-Off too when closing for good. Idempotent: a bus
    /// without an open port does nothing.
    pub fn shut_off(&self, seq: &dyn Sequencer) {
        self.shut_off_ex(seq, false);
    }

    pub fn shut_off_ex(&self, seq: &dyn Sequencer, closing: bool) {
        if self.port().is_none() {
            return;
        }
        let channels: Vec<u8> = self.patches.lock().unwrap().keys().copied().collect();
        for channel in channels {
            self.set_controller_ex(seq, channel, cc::ALL_SOUND_OFF, 0, None);
            self.set_controller_ex(seq, channel, cc::ALL_NOTES_OFF, 0, None);
            if closing {
                self.set_controller_ex(seq, channel, cc::ALL_CONTROLLERS_OFF, 0, None);
            }
        }
    }

    /// Mode change: allocate the resources of the new side(s), release
    /// the dropped side(s), keep everything on the retained side
    pub fn update_bus_mode(&self, new_mode: BusMode) {
        *self.mode.lock().unwrap() = new_mode;
        self.alloc_mode_resources(new_mode);
        if !new_mode.has_input() {
            *self.monitor_in.lock().unwrap() = None;
            *self.plugins_in.lock().unwrap() = None;
        }
        if !new_mode.has_output() {
            *self.monitor_out.lock().unwrap() = None;
            *self.plugins_out.lock().unwrap() = None;
            *self.sysex_list.lock().unwrap() = None;
        }
    }

    /// Populate or apply a connection list
    ///
    /// With `do_connect` unset, fill `connects` with the currently
    /// subscribed remote endpoints. With it set, resolve each entry
    /// against the live graph and subscribe it; successful entries are
    /// removed. Returns the number of effective new connections.
    pub fn update_connects(
        &self,
        seq: &dyn Sequencer,
        mode: BusMode,
        connects: &mut ConnectList,
        do_connect: bool,
    ) -> usize {
        let bus_mode = self.mode();
        let want_input = mode.has_input() && bus_mode.has_input();
        let want_output = mode.has_output() && bus_mode.has_output();
        if !want_input && !want_output {
            return 0;
        }
        if do_connect && connects.is_empty() {
            return 0;
        }
        let Some(port) = self.port() else { return 0 };

        // Remote candidates must carry the capabilities of the far side
        let (peer_caps, dir) = if want_input {
            (caps::READ | caps::SUBS_READ, SubsDir::Write)
        } else {
            (caps::WRITE | caps::SUBS_WRITE, SubsDir::Read)
        };

        // Refresh client/port ids on the named entries
        for info in seq.list_endpoints(peer_caps) {
            for item in connects.iter_mut() {
                if item.matches(&info) {
                    item.client = Some(info.client);
                    item.port = Some(info.port);
                }
            }
        }

        // Walk what is already subscribed
        for info in seq.query_subscriptions(port, dir) {
            if do_connect {
                connects.retain(|item| !item.matches(&info));
            } else {
                connects.push(ConnectItem::from(&info));
            }
        }

        if !do_connect {
            return 0;
        }

        // Try the remaining resolved entries
        let me = Addr::new(seq.client_id(), port);
        let mut update = 0;
        connects.retain(|item| {
            let (Some(client), Some(remote)) = (item.client, item.port) else {
                return true;
            };
            let peer = Addr::new(client, remote);
            let (sender, dest) = if want_input { (peer, me) } else { (me, peer) };
            if seq.subscribe(sender, dest).is_ok() {
                update += 1;
                false
            } else {
                true
            }
        });
        update
    }

    /// Record a channel patch and emit the bank/program selection
    ///
    /// Bank MSB and/or LSB go out first per the selection method, then
    /// the program change; all three are duplicated to the output
    /// plugin chain and, when given, the track's chain.
    #[allow(clippy::too_many_arguments)]
    pub fn set_patch(
        &self,
        seq: &dyn Sequencer,
        channel: u8,
        instrument_name: &str,
        bank_sel_method: BankSelMethod,
        bank: i32,
        prog: i32,
        track_chain: Option<&PluginChain>,
    ) {
        if prog < 0 {
            return;
        }
        let channel = channel & 0x0f;

        if !instrument_name.is_empty() {
            self.patches.lock().unwrap().insert(
                channel,
                Patch {
                    instrument_name: instrument_name.to_string(),
                    bank_sel_method,
                    bank,
                    prog,
                },
            );
        }

        // Engine not activated yet: the patch is recorded, nothing sent
        let Some(port) = self.port() else { return };

        let bus_chain = self.plugins_out();
        let send = |kind: SeqEventKind| {
            let ev = SeqEvent::direct(kind, channel, port);
            seq.event_output_direct(ev.clone());
            if let Some(chain) = track_chain {
                chain.direct(&ev);
            }
            if let Some(chain) = &bus_chain {
                chain.direct(&ev);
            }
        };

        if bank >= 0 && matches!(bank_sel_method, BankSelMethod::MsbLsb | BankSelMethod::Msb) {
            let value = if bank_sel_method == BankSelMethod::Msb {
                bank & 0x007f
            } else {
                (bank & 0x3f80) >> 7
            };
            send(SeqEventKind::Controller { param: cc::BANK_SELECT_MSB, value });
        }
        if bank >= 0 && matches!(bank_sel_method, BankSelMethod::MsbLsb | BankSelMethod::Lsb) {
            send(SeqEventKind::Controller { param: cc::BANK_SELECT_LSB, value: bank & 0x007f });
        }
        send(SeqEventKind::ProgChange { value: prog });
    }

    /// Direct (unscheduled) controller send
    pub fn set_controller(&self, seq: &dyn Sequencer, channel: u8, param: u8, value: i32) {
        self.set_controller_ex(seq, channel, param, value, None);
    }

    pub fn set_controller_ex(
        &self,
        seq: &dyn Sequencer,
        channel: u8,
        param: u8,
        value: i32,
        track_chain: Option<&PluginChain>,
    ) {
        let Some(port) = self.port() else { return };
        let ev = SeqEvent::direct(SeqEventKind::Controller { param, value }, channel & 0x0f, port);
        seq.event_output_direct(ev.clone());
        if let Some(chain) = track_chain {
            chain.direct(&ev);
        }
        if let Some(chain) = self.plugins_out() {
            chain.direct(&ev);
        }
    }

    /// Direct note on/off send with monitor bookkeeping
    pub fn send_note(
        &self,
        seq: &dyn Sequencer,
        channel: u8,
        note: u8,
        velocity: u8,
        track_monitor: Option<&MidiMonitor>,
    ) {
        let Some(port) = self.port() else { return };
        let kind = if velocity > 0 {
            SeqEventKind::NoteOn { note, velocity, duration: 0 }
        } else {
            SeqEventKind::NoteOff { note, velocity: 0, duration: 0 }
        };
        let ev = SeqEvent::direct(kind, channel & 0x0f, port);
        seq.event_output_direct(ev.clone());
        if let Some(chain) = self.plugins_out() {
            chain.direct(&ev);
        }
        if velocity > 0 {
            if let Some(monitor) = self.monitor_out() {
                monitor.enqueue(velocity);
            }
            if let Some(monitor) = track_monitor {
                monitor.enqueue(velocity);
            }
        }
    }

    /// Direct SysEx send
    pub fn send_sysex(&self, seq: &dyn Sequencer, bytes: &[u8]) {
        let Some(port) = self.port() else { return };
        let ev = SeqEvent::direct(SeqEventKind::SysEx(bytes.into()), 0, port);
        seq.event_output_direct(ev);
    }

    /// Send the whole SysEx setup list, then flush
    pub fn send_sysex_list(&self, seq: &dyn Sequencer) {
        let items = self.sysex_list();
        if items.is_empty() || self.port().is_none() {
            return;
        }
        for item in &items {
            self.send_sysex(seq, &item.data);
        }
        seq.drain_output();
    }

    /// Rebuild the SysEx setup list from the SYSEX events of a
    /// captured or imported sequence
    pub fn import_sysex_list(&self, seq_name: &str, events: &[crate::event::MidiEvent]) -> bool {
        let mut sysex = self.sysex_list.lock().unwrap();
        let Some(list) = sysex.as_mut() else { return false };
        list.clear();
        let mut index = 0;
        for ev in events {
            if let crate::event::EventKind::SysEx(data) = &ev.kind {
                index += 1;
                list.push(SysexItem {
                    name: format!("{}-{}", seq_name, index),
                    data: data.clone(),
                });
            }
        }
        true
    }

    /// Universal SysEx master volume (device-wide)
    pub fn set_master_volume(&self, seq: &dyn Sequencer, volume: f32) {
        let vol = ((127.0 * volume) as i32 & 0x7f) as u8;
        let mut sysex = [0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, 0x00, 0xf7];
        if volume >= 1.0 {
            sysex[5] = 0x7f;
        }
        sysex[6] = vol;
        self.send_sysex(seq, &sysex);
    }

    /// Universal SysEx master panning (device-wide)
    pub fn set_master_panning(&self, seq: &dyn Sequencer, panning: f32) {
        let pan = ((0x40 + (63.0 * panning) as i32) & 0x7f) as u8;
        let mut sysex = [0xf0, 0x7f, 0x7f, 0x04, 0x02, 0x00, 0x00, 0xf7];
        if panning >= 1.0 {
            sysex[5] = 0x7f;
        }
        if panning > -1.0 {
            sysex[6] = pan;
        }
        self.send_sysex(seq, &sysex);
    }

    /// Channel volume as CC#7
    pub fn set_volume(&self, seq: &dyn Sequencer, channel: u8, volume: f32) {
        let vol = (127.0 * volume) as i32 & 0x7f;
        self.set_controller(seq, channel, cc::CHANNEL_VOLUME, vol);
    }

    /// Channel panning as CC#10
    pub fn set_panning(&self, seq: &dyn Sequencer, channel: u8, panning: f32) {
        let pan = (0x40 + (63.0 * panning) as i32) & 0x7f;
        self.set_controller(seq, channel, cc::CHANNEL_PANNING, pan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::VirtualSequencer;

    fn open_bus(seq: &VirtualSequencer, name: &str, mode: BusMode) -> MidiBus {
        let bus = MidiBus::new(name, mode, false);
        bus.open(seq).unwrap();
        bus
    }

    #[test]
    fn test_duplex_bus_shares_one_port() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Master", BusMode::Duplex);
        assert!(bus.port().is_some());
        // A second open under the same name must fail: names are unique
        let twin = MidiBus::new("Master", BusMode::Output, false);
        assert!(twin.open(&seq).is_err());
    }

    #[test]
    fn test_mode_resources() {
        let bus = MidiBus::new("In only", BusMode::Input, false);
        assert!(bus.monitor_in().is_some());
        assert!(bus.monitor_out().is_none());
        assert!(bus.plugins_out().is_none());

        let duplex = MidiBus::new("Both", BusMode::Duplex, true);
        assert!(duplex.monitor_in().is_some());
        assert!(duplex.monitor_out().is_some());
        assert!(duplex.is_passthrough());
    }

    #[test]
    fn test_update_bus_mode_preserves_retained_side() {
        let bus = MidiBus::new("Main", BusMode::Duplex, false);
        let monitor_out = bus.monitor_out().unwrap();
        monitor_out.set_gain(0.7);

        bus.update_bus_mode(BusMode::Output);
        assert!(bus.monitor_in().is_none());
        assert!(bus.plugins_in().is_none());
        // The kept output monitor is the same object
        assert_eq!(bus.monitor_out().unwrap().gain(), 0.7);
    }

    #[test]
    fn test_set_patch_emits_bank_then_program() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Synths", BusMode::Output);

        // Bank 0x0180, MSB+LSB method, on channel 3
        bus.set_patch(&seq, 3, "Lead", BankSelMethod::MsbLsb, 0x0180, 5, None);

        let sent = seq.take_delivered();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[0].kind,
            SeqEventKind::Controller { param: cc::BANK_SELECT_MSB, value: 0x03 }
        );
        assert_eq!(
            sent[1].kind,
            SeqEventKind::Controller { param: cc::BANK_SELECT_LSB, value: 0x00 }
        );
        assert_eq!(sent[2].kind, SeqEventKind::ProgChange { value: 5 });
        assert!(sent.iter().all(|ev| ev.channel == 3));

        // And the patch is recorded
        let patch = bus.patch(3).unwrap();
        assert_eq!(patch.bank, 0x0180);
        assert_eq!(patch.prog, 5);
    }

    #[test]
    fn test_set_patch_msb_only_uses_low_bits() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Sampler", BusMode::Output);
        bus.set_patch(&seq, 0, "Kit", BankSelMethod::Msb, 9, 0, None);

        let sent = seq.take_delivered();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].kind,
            SeqEventKind::Controller { param: cc::BANK_SELECT_MSB, value: 9 }
        );
        assert_eq!(sent[1].kind, SeqEventKind::ProgChange { value: 0 });
    }

    #[test]
    fn test_shut_off_sweeps_patched_channels() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Out", BusMode::Output);
        bus.set_patch(&seq, 2, "Piano", BankSelMethod::MsbLsb, 0, 1, None);
        seq.take_delivered();

        bus.shut_off(&seq);
        let sent = seq.take_delivered();
        let params: Vec<u8> = sent
            .iter()
            .filter_map(|ev| match ev.kind {
                SeqEventKind::Controller { param, .. } => Some(param),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![cc::ALL_SOUND_OFF, cc::ALL_NOTES_OFF]);

        // Closing adds the controller reset and is idempotent afterwards
        bus.close(&seq);
        let sent = seq.take_delivered();
        assert!(sent.iter().any(|ev| matches!(
            ev.kind,
            SeqEventKind::Controller { param, .. } if param == cc::ALL_CONTROLLERS_OFF
        )));
        bus.shut_off(&seq);
        assert_eq!(seq.delivered_len(), 0);
    }

    #[test]
    fn test_update_connects_populate_and_apply() {
        let seq = VirtualSequencer::new("test");
        seq.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);
        let bus = open_bus(&seq, "Out", BusMode::Output);

        // Apply: one named entry, resolved and subscribed
        let mut connects = vec![ConnectItem::named("FluidSynth", "midi_00")];
        let n = bus.update_connects(&seq, BusMode::Output, &mut connects, true);
        assert_eq!(n, 1);
        assert!(connects.is_empty());
        assert_eq!(seq.subscriptions().len(), 1);

        // Populate: the live subscription comes back
        let mut current = ConnectList::new();
        bus.update_connects(&seq, BusMode::Output, &mut current, false);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].client_name, "FluidSynth");

        // Re-applying the same entry is a no-op (already connected)
        let mut again = vec![ConnectItem::named("FluidSynth", "midi_00")];
        let n = bus.update_connects(&seq, BusMode::Output, &mut again, true);
        assert_eq!(n, 0);
        assert!(again.is_empty());
    }

    #[test]
    fn test_update_connects_keeps_unresolved_entries() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Out", BusMode::Output);
        let mut connects = vec![ConnectItem::named("NotThere", "port")];
        let n = bus.update_connects(&seq, BusMode::Output, &mut connects, true);
        assert_eq!(n, 0);
        // Unresolved entries stay for a later retry
        assert_eq!(connects.len(), 1);
    }

    #[test]
    fn test_send_note_updates_monitors() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Out", BusMode::Output);
        let track_monitor = MidiMonitor::new();

        bus.send_note(&seq, 0, 60, 100, Some(&track_monitor));
        assert_eq!(bus.monitor_out().unwrap().update(0), 100);
        assert_eq!(track_monitor.update(0), 100);

        // Note off: no monitor bump
        bus.send_note(&seq, 0, 60, 0, Some(&track_monitor));
        assert_eq!(track_monitor.event_count(), 1);

        let sent = seq.take_delivered();
        assert!(matches!(sent[0].kind, SeqEventKind::NoteOn { note: 60, velocity: 100, .. }));
        assert!(matches!(sent[1].kind, SeqEventKind::NoteOff { note: 60, .. }));
    }

    #[test]
    fn test_import_sysex_list_from_events() {
        use crate::event::{EventKind, MidiEvent};

        let bus = MidiBus::new("Out", BusMode::Output, false);
        let events = vec![
            MidiEvent::new(0, 0, EventKind::SysEx(vec![0xf0, 0x01, 0xf7])),
            MidiEvent::new(0, 0, EventKind::ProgChange { program: 1 }),
            MidiEvent::new(10, 0, EventKind::SysEx(vec![0xf0, 0x02, 0xf7])),
        ];
        assert!(bus.import_sysex_list("setup", &events));

        let list = bus.sysex_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "setup-1");
        assert_eq!(list[1].data, vec![0xf0, 0x02, 0xf7]);

        // Input-only buses have no SysEx setup side
        let input = MidiBus::new("In", BusMode::Input, false);
        assert!(!input.import_sysex_list("setup", &events));
    }

    #[test]
    fn test_master_volume_sysex() {
        let seq = VirtualSequencer::new("test");
        let bus = open_bus(&seq, "Out", BusMode::Output);
        bus.set_master_volume(&seq, 0.5);

        let sent = seq.take_delivered();
        match &sent[0].kind {
            SeqEventKind::SysEx(bytes) => {
                assert_eq!(bytes[0], 0xf0);
                assert_eq!(&bytes[1..5], &[0x7f, 0x7f, 0x04, 0x01]);
                assert_eq!(bytes[6], 63);
                assert_eq!(bytes[7], 0xf7);
            }
            other => panic!("expected sysex, got {:?}", other),
        }
    }
}
