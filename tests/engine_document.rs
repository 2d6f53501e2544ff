//! Engine document binding: bus lists, patches, SysEx setup and
//! connection lists survive a save/load round trip.

use std::io::{Read, Write};
use std::sync::Arc;

use seqcore::bus::{BankSelMethod, BusMode, ConnectItem, MidiBus, SysexItem};
use seqcore::document::{deserialize_from_ron, serialize_to_ron};
use seqcore::seq::{caps, Sequencer};
use seqcore::{AudioEngine, MidiEngine, Session, VirtualSequencer};

fn new_engine(seq: Arc<VirtualSequencer>) -> MidiEngine {
    let session = Arc::new(Session::new("seqcore-doc", 48000, 960));
    let audio = Arc::new(AudioEngine::new(48000, 512));
    MidiEngine::new(seq, session, audio)
}

fn populated_engine(seq: Arc<VirtualSequencer>) -> MidiEngine {
    let mut engine = new_engine(seq.clone());
    engine.init().unwrap();

    let master = MidiBus::new("Master", BusMode::Duplex, true);
    master.set_instrument_name("GM");
    master.set_sysex_list(vec![SysexItem {
        name: "gm-reset".into(),
        data: vec![0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7],
    }]);
    let master = engine.add_bus(master).unwrap();
    engine.add_bus(MidiBus::new("Aux Out", BusMode::Output, false)).unwrap();

    engine.activate().unwrap();
    let bus = engine.bus(master).unwrap();
    bus.set_patch(&*seq as &dyn Sequencer, 3, "Lead", BankSelMethod::MsbLsb, 0x0180, 5, None);

    // One live output connection
    let mut connects = vec![ConnectItem::named("FluidSynth", "midi_00")];
    bus.update_connects(&*seq as &dyn Sequencer, BusMode::Output, &mut connects, true);

    engine.set_mmc_device(0x10);
    engine.set_clock_mode(BusMode::Output);
    engine
}

#[test]
fn test_save_document_snapshots_engine_state() {
    let seq = Arc::new(VirtualSequencer::new("seqcore-doc"));
    seq.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);
    let engine = populated_engine(seq);

    let doc = engine.save_document();
    assert_eq!(doc.control.mmc_device, 0x10);
    assert_eq!(doc.control.clock_mode, "output");
    assert_eq!(doc.buses.len(), 2);

    let master = &doc.buses[0];
    assert_eq!(master.name, "Master");
    assert_eq!(master.mode, "duplex");
    assert!(master.passthrough);
    assert_eq!(master.instrument_name.as_deref(), Some("GM"));
    assert_eq!(master.patches.len(), 1);
    assert_eq!(master.patches[0].bank, 0x0180);
    assert_eq!(master.sysex_list[0].text, "f07e7f0901f7");
    assert_eq!(master.output_connects.len(), 1);
    assert_eq!(master.output_connects[0].client, "FluidSynth");
}

#[test]
fn test_document_file_round_trip() {
    let seq = Arc::new(VirtualSequencer::new("seqcore-doc"));
    seq.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);
    let engine = populated_engine(seq);
    let doc = engine.save_document();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.seqcore");
    let text = serialize_to_ron(&doc).unwrap();
    std::fs::File::create(&path).unwrap().write_all(text.as_bytes()).unwrap();

    let mut body = String::new();
    std::fs::File::open(&path).unwrap().read_to_string(&mut body).unwrap();
    let loaded = deserialize_from_ron(&body).unwrap();

    assert_eq!(loaded.buses.len(), 2);
    assert_eq!(loaded.buses[0].patches[0].program, 5);
    assert_eq!(loaded.control.mmc_device, 0x10);
}

#[test]
fn test_load_document_rebuilds_and_reconnects() {
    let seq = Arc::new(VirtualSequencer::new("seqcore-doc"));
    seq.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);
    let doc = populated_engine(seq).save_document();

    // A fresh backend and engine pick the document up
    let seq2 = Arc::new(VirtualSequencer::new("seqcore-doc2"));
    seq2.add_remote(20, 0, "FluidSynth", "midi_00", caps::WRITE | caps::SUBS_WRITE);
    let mut engine = new_engine(seq2.clone());
    engine.init().unwrap();
    engine.load_document(&doc).unwrap();

    assert_eq!(engine.buses().len(), 2);
    let (_, master) = engine.find_bus("Master").unwrap();
    assert_eq!(master.mode(), BusMode::Duplex);
    assert_eq!(master.patch(3).unwrap().prog, 5);
    assert_eq!(master.pending_outputs().len(), 1);

    // Activation opens the ports, the connect pass resubscribes
    engine.activate().unwrap();
    let updates = engine.update_connects();
    assert_eq!(updates, 1);
    assert_eq!(seq2.subscriptions().len(), 1);
    assert!(master.pending_outputs().is_empty());

    // The deferred controller reset went out: SysEx setup re-sent
    let sent = seq2.take_delivered();
    assert!(sent.iter().any(|ev| matches!(
        &ev.kind,
        seqcore::seq::SeqEventKind::SysEx(bytes) if bytes[1] == 0x7e
    )));
}
