// Document binding
// Load/save of the engine-owned session fields: control modes, bus
// list, patches, SysEx setup, connection lists

use serde::{Deserialize, Serialize};

use crate::bus::{
    BankSelMethod, BusMode, ConnectItem, ConnectList, MidiBus, Patch, SysexItem,
};
use crate::error::{EngineError, EngineResult};
use crate::seq::Sequencer;

/// One persisted remote connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectDoc {
    pub client: String,
    pub port: String,
}

impl From<&ConnectItem> for ConnectDoc {
    fn from(item: &ConnectItem) -> Self {
        Self { client: item.client_name.clone(), port: item.port_name.clone() }
    }
}

impl From<&ConnectDoc> for ConnectItem {
    fn from(doc: &ConnectDoc) -> Self {
        ConnectItem::named(&doc.client, &doc.port)
    }
}

/// One channel patch entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchDoc {
    pub channel: u8,
    pub instrument: String,
    pub bank_sel_method: i32,
    pub bank: i32,
    pub program: i32,
}

/// SysEx setup entry, payload as hex text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysexDoc {
    pub name: String,
    pub text: String,
}

/// Persisted form of one MIDI bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiBusDoc {
    pub name: String,
    pub mode: String,
    pub passthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_panning: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_panning: Option<f32>,
    #[serde(default)]
    pub input_plugins: Vec<String>,
    #[serde(default)]
    pub output_plugins: Vec<String>,
    #[serde(default)]
    pub input_connects: Vec<ConnectDoc>,
    #[serde(default)]
    pub output_connects: Vec<ConnectDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_name: Option<String>,
    #[serde(default)]
    pub patches: Vec<PatchDoc>,
    #[serde(default)]
    pub sysex_list: Vec<SysexDoc>,
}

/// Transport/control mode block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiControlDoc {
    pub mmc_mode: String,
    pub mmc_device: u8,
    pub spp_mode: String,
    pub clock_mode: String,
}

impl Default for MidiControlDoc {
    fn default() -> Self {
        Self {
            mmc_mode: BusMode::Duplex.as_str().to_string(),
            mmc_device: 0x7f,
            spp_mode: BusMode::Duplex.as_str().to_string(),
            clock_mode: BusMode::None.as_str().to_string(),
        }
    }
}

/// The engine-owned document fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineDocument {
    pub control: MidiControlDoc,
    #[serde(default)]
    pub buses: Vec<MidiBusDoc>,
    #[serde(default)]
    pub control_inputs: Vec<ConnectDoc>,
    #[serde(default)]
    pub control_outputs: Vec<ConnectDoc>,
    #[serde(default)]
    pub metronome_outputs: Vec<ConnectDoc>,
}

/// Small JSON metadata fragment saved next to the document body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub version: u32,
    pub client_name: String,
}

pub fn serialize_to_ron(doc: &EngineDocument) -> EngineResult<String> {
    ron::to_string(doc).map_err(|e| EngineError::Document(format!("RON serialize: {}", e)))
}

pub fn deserialize_from_ron(text: &str) -> EngineResult<EngineDocument> {
    ron::from_str(text).map_err(|e| EngineError::Document(format!("RON deserialize: {}", e)))
}

pub fn serialize_meta_to_json(meta: &DocumentMeta) -> EngineResult<String> {
    serde_json::to_string_pretty(meta)
        .map_err(|e| EngineError::Document(format!("JSON serialize: {}", e)))
}

pub fn deserialize_meta_from_json(text: &str) -> EngineResult<DocumentMeta> {
    serde_json::from_str(text).map_err(|e| EngineError::Document(format!("JSON deserialize: {}", e)))
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hex_to_bytes(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text
        .chars()
        .filter_map(|c| c.to_digit(16).map(|d| d as u8))
        .collect();
    digits.chunks(2).map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0)).collect()
}

pub fn connects_to_doc(connects: &ConnectList) -> Vec<ConnectDoc> {
    connects.iter().map(ConnectDoc::from).collect()
}

pub fn connects_from_doc(docs: &[ConnectDoc]) -> ConnectList {
    docs.iter().map(ConnectItem::from).collect()
}

/// Snapshot a live bus, querying the current connections
pub fn bus_to_doc(bus: &MidiBus, seq: &dyn Sequencer) -> MidiBusDoc {
    let mode = bus.mode();

    let mut input_connects = ConnectList::new();
    let mut output_connects = ConnectList::new();
    if mode.has_input() {
        bus.update_connects(seq, BusMode::Input, &mut input_connects, false);
    }
    if mode.has_output() {
        bus.update_connects(seq, BusMode::Output, &mut output_connects, false);
    }

    let instrument_name = bus.instrument_name();
    MidiBusDoc {
        name: bus.name().to_string(),
        mode: mode.as_str().to_string(),
        passthrough: bus.is_passthrough(),
        input_gain: bus.monitor_in().map(|m| m.gain()),
        input_panning: bus.monitor_in().map(|m| m.panning()),
        output_gain: bus.monitor_out().map(|m| m.gain()),
        output_panning: bus.monitor_out().map(|m| m.panning()),
        input_plugins: bus.plugins_in().map(|p| p.plugin_names()).unwrap_or_default(),
        output_plugins: bus.plugins_out().map(|p| p.plugin_names()).unwrap_or_default(),
        input_connects: connects_to_doc(&input_connects),
        output_connects: connects_to_doc(&output_connects),
        instrument_name: (!instrument_name.is_empty()).then_some(instrument_name),
        patches: bus
            .patches()
            .iter()
            .map(|(channel, patch)| PatchDoc {
                channel: *channel,
                instrument: patch.instrument_name.clone(),
                bank_sel_method: patch.bank_sel_method.to_i32(),
                bank: patch.bank,
                program: patch.prog,
            })
            .collect(),
        sysex_list: bus
            .sysex_list()
            .iter()
            .map(|item| SysexDoc { name: item.name.clone(), text: bytes_to_hex(&item.data) })
            .collect(),
    }
}

/// Recreate a bus from its persisted form; connects go into the pending
/// lists for a later `update_connects` pass
pub fn bus_from_doc(doc: &MidiBusDoc) -> MidiBus {
    let bus = MidiBus::new(&doc.name, BusMode::from_str(&doc.mode), doc.passthrough);

    if let Some(monitor) = bus.monitor_in() {
        if let Some(gain) = doc.input_gain {
            monitor.set_gain(gain);
        }
        if let Some(panning) = doc.input_panning {
            monitor.set_panning(panning);
        }
    }
    if let Some(monitor) = bus.monitor_out() {
        if let Some(gain) = doc.output_gain {
            monitor.set_gain(gain);
        }
        if let Some(panning) = doc.output_panning {
            monitor.set_panning(panning);
        }
    }
    if let Some(plugins) = bus.plugins_in() {
        plugins.set_plugin_names(doc.input_plugins.clone());
    }
    if let Some(plugins) = bus.plugins_out() {
        plugins.set_plugin_names(doc.output_plugins.clone());
    }
    if let Some(name) = &doc.instrument_name {
        bus.set_instrument_name(name);
    }

    let patches = doc
        .patches
        .iter()
        // An instrument-less patch entry is invalid, same as on load of
        // a hand-edited document
        .filter(|p| !p.instrument.is_empty())
        .map(|p| {
            (
                p.channel & 0x0f,
                Patch {
                    instrument_name: p.instrument.clone(),
                    bank_sel_method: BankSelMethod::from_i32(p.bank_sel_method),
                    bank: p.bank,
                    prog: p.program,
                },
            )
        })
        .collect();
    bus.load_patches(patches);

    bus.set_sysex_list(
        doc.sysex_list
            .iter()
            .map(|s| SysexItem { name: s.name.clone(), data: hex_to_bytes(&s.text) })
            .filter(|item| !item.data.is_empty())
            .collect(),
    );

    *bus.pending_inputs() = connects_from_doc(&doc.input_connects);
    *bus.pending_outputs() = connects_from_doc(&doc.output_connects);
    bus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::{caps, VirtualSequencer};

    #[test]
    fn test_hex_round_trip() {
        let bytes = vec![0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7];
        let text = bytes_to_hex(&bytes);
        assert_eq!(text, "f07e7f0901f7");
        assert_eq!(hex_to_bytes(&text), bytes);
    }

    #[test]
    fn test_engine_document_ron_round_trip() {
        let doc = EngineDocument {
            control: MidiControlDoc {
                mmc_mode: "output".into(),
                mmc_device: 0x10,
                spp_mode: "duplex".into(),
                clock_mode: "input".into(),
            },
            buses: vec![MidiBusDoc {
                name: "Master".into(),
                mode: "duplex".into(),
                passthrough: true,
                input_gain: Some(1.0),
                input_panning: Some(0.0),
                output_gain: Some(0.8),
                output_panning: Some(-0.2),
                input_plugins: vec!["monitor".into()],
                output_plugins: vec![],
                input_connects: vec![ConnectDoc { client: "Keys".into(), port: "out".into() }],
                output_connects: vec![],
                instrument_name: Some("GM".into()),
                patches: vec![PatchDoc {
                    channel: 3,
                    instrument: "Lead".into(),
                    bank_sel_method: 0,
                    bank: 0x0180,
                    program: 5,
                }],
                sysex_list: vec![SysexDoc { name: "reset".into(), text: "f07e7f0901f7".into() }],
            }],
            control_inputs: vec![ConnectDoc { client: "Pad".into(), port: "ctl".into() }],
            control_outputs: vec![],
            metronome_outputs: vec![],
        };

        let text = serialize_to_ron(&doc).unwrap();
        let back = deserialize_from_ron(&text).unwrap();
        assert_eq!(back.control.mmc_device, 0x10);
        assert_eq!(back.buses.len(), 1);
        assert_eq!(back.buses[0].patches[0].bank, 0x0180);
        assert_eq!(back.control_inputs.len(), 1);
    }

    #[test]
    fn test_meta_json_round_trip() {
        let meta = DocumentMeta { version: 1, client_name: "seqcore".into() };
        let text = serialize_meta_to_json(&meta).unwrap();
        let back = deserialize_meta_from_json(&text).unwrap();
        assert_eq!(back.client_name, "seqcore");
    }

    #[test]
    fn test_bus_round_trip_through_doc() {
        let seq = VirtualSequencer::new("test");
        seq.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);

        let bus = MidiBus::new("Master", BusMode::Duplex, true);
        bus.open(&seq).unwrap();
        bus.monitor_out().unwrap().set_gain(0.75);
        bus.set_instrument_name("GM");
        bus.set_patch(&seq, 3, "Lead", BankSelMethod::MsbLsb, 0x0180, 5, None);
        bus.set_sysex_list(vec![SysexItem { name: "reset".into(), data: vec![0xf0, 0xf7] }]);
        let mut connects = vec![ConnectItem::named("FluidSynth", "midi_00")];
        bus.update_connects(&seq, BusMode::Output, &mut connects, true);

        let doc = bus_to_doc(&bus, &seq);
        assert_eq!(doc.name, "Master");
        assert_eq!(doc.mode, "duplex");
        assert!(doc.passthrough);
        assert_eq!(doc.output_gain, Some(0.75));
        assert_eq!(doc.output_connects.len(), 1);
        assert_eq!(doc.patches.len(), 1);

        let restored = bus_from_doc(&doc);
        assert_eq!(restored.name(), "Master");
        assert_eq!(restored.mode(), BusMode::Duplex);
        assert_eq!(restored.monitor_out().unwrap().gain(), 0.75);
        assert_eq!(restored.patch(3).unwrap().prog, 5);
        assert_eq!(restored.sysex_list()[0].data, vec![0xf0, 0xf7]);
        assert_eq!(restored.pending_outputs()[0].client_name, "FluidSynth");
    }

    #[test]
    fn test_invalid_patch_entries_dropped_on_load() {
        let doc = MidiBusDoc {
            name: "B".into(),
            mode: "output".into(),
            passthrough: false,
            input_gain: None,
            input_panning: None,
            output_gain: None,
            output_panning: None,
            input_plugins: vec![],
            output_plugins: vec![],
            input_connects: vec![],
            output_connects: vec![],
            instrument_name: None,
            patches: vec![PatchDoc {
                channel: 0,
                instrument: String::new(),
                bank_sel_method: 0,
                bank: 0,
                program: 1,
            }],
            sysex_list: vec![],
        };
        let bus = bus_from_doc(&doc);
        assert!(bus.patch(0).is_none());
    }
}
