// Transport control protocol
// MMC universal-sysex encode/decode, SPP commands and the incoming
// clock tempo estimator

use std::time::Instant;

/// MMC command codes (universal real-time sysex, command mode 0x06)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcCommand {
    Stop = 0x01,
    Play = 0x02,
    DeferredPlay = 0x03,
    FastForward = 0x04,
    Rewind = 0x05,
    RecordStrobe = 0x06,
    RecordExit = 0x07,
    RecordPause = 0x08,
    Pause = 0x09,
    Eject = 0x0a,
    Reset = 0x0d,
    MaskedWrite = 0x41,
    Locate = 0x44,
}

impl MmcCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => MmcCommand::Stop,
            0x02 => MmcCommand::Play,
            0x03 => MmcCommand::DeferredPlay,
            0x04 => MmcCommand::FastForward,
            0x05 => MmcCommand::Rewind,
            0x06 => MmcCommand::RecordStrobe,
            0x07 => MmcCommand::RecordExit,
            0x08 => MmcCommand::RecordPause,
            0x09 => MmcCommand::Pause,
            0x0a => MmcCommand::Eject,
            0x0d => MmcCommand::Reset,
            0x41 => MmcCommand::MaskedWrite,
            0x44 => MmcCommand::Locate,
            _ => return None,
        })
    }
}

/// Masked-write information fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcSubCommand {
    TrackRecord = 0x4f,
    TrackMute = 0x62,
}

impl MmcSubCommand {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x4f => Some(MmcSubCommand::TrackRecord),
            0x62 => Some(MmcSubCommand::TrackMute),
            _ => None,
        }
    }
}

/// A decoded MMC message
#[derive(Debug, Clone, PartialEq)]
pub struct MmcEvent {
    pub device: u8,
    pub cmd: MmcCommand,
    pub data: Vec<u8>,
}

impl MmcEvent {
    /// Decode an incoming universal real-time sysex; `None` when the
    /// bytes are not an MMC command message
    pub fn decode(sysex: &[u8]) -> Option<Self> {
        if sysex.len() < 6 || sysex[0] != 0xf0 || sysex[1] != 0x7f || sysex[3] != 0x06 {
            return None;
        }
        if *sysex.last().unwrap() != 0xf7 {
            return None;
        }
        let cmd = MmcCommand::from_byte(sysex[4])?;
        let body = &sysex[5..sysex.len() - 1];
        let data = match body.first() {
            Some(&len) if body.len() >= 1 + len as usize => body[1..1 + len as usize].to_vec(),
            _ => Vec::new(),
        };
        Some(Self { device: sysex[2], cmd, data })
    }

    /// Locate target in 30 fps timecode frames, when this is a LOCATE
    pub fn locate(&self) -> Option<u64> {
        if self.cmd != MmcCommand::Locate || self.data.len() < 5 || self.data[0] != 0x01 {
            return None;
        }
        let hh = self.data[1] as u64;
        let mm = self.data[2] as u64;
        let ss = self.data[3] as u64;
        let ff = self.data[4] as u64;
        Some(((hh * 60 + mm) * 60 + ss) * 30 + ff)
    }

    /// Masked-write payload `(scmd, track, on)` when this is one
    pub fn masked_write(&self) -> Option<(MmcSubCommand, u16, bool)> {
        if self.cmd != MmcCommand::MaskedWrite || self.data.len() < 4 {
            return None;
        }
        let scmd = MmcSubCommand::from_byte(self.data[0])?;
        let group = self.data[1] as u16;
        let mask = self.data[2];
        let bit = mask.trailing_zeros() as u16;
        let track = if group == 0 {
            bit.checked_sub(5)?
        } else {
            2 + (group - 1) * 7 + bit
        };
        Some((scmd, track, self.data[3] & mask != 0))
    }
}

/// Assemble `F0 7F <device> 06 <cmd> [len data..] F7`
pub fn encode_mmc(device: u8, cmd: MmcCommand, data: &[u8]) -> Vec<u8> {
    let mut sysex = Vec::with_capacity(7 + data.len());
    sysex.push(0xf0);
    sysex.push(0x7f);
    sysex.push(device);
    sysex.push(0x06);
    sysex.push(cmd as u8);
    if !data.is_empty() {
        sysex.push(data.len() as u8);
        sysex.extend_from_slice(data);
    }
    sysex.push(0xf7);
    sysex
}

/// LOCATE target data: 30 fps timecode split with a trailing sub-frame 0
pub fn mmc_locate_data(mut frame: u64) -> [u8; 6] {
    let mut data = [0u8; 6];
    data[0] = 0x01;
    data[1] = (frame / (3600 * 30)) as u8;
    frame -= (3600 * 30) * data[1] as u64;
    data[2] = (frame / (60 * 30)) as u8;
    frame -= (60 * 30) * data[2] as u64;
    data[3] = (frame / 30) as u8;
    frame -= 30 * data[3] as u64;
    data[4] = frame as u8;
    data[5] = 0;
    data
}

/// MASKED_WRITE payload for the 7-track-group layout
pub fn mmc_masked_write_data(scmd: MmcSubCommand, track: u16, on: bool) -> [u8; 4] {
    let mask = 1u8 << (if track < 2 { track + 5 } else { (track - 2) % 7 });
    [
        scmd as u8,
        if track < 2 { 0 } else { 1 + ((track - 2) / 7) as u8 },
        mask,
        if on { mask } else { 0 },
    ]
}

/// SPP transport message family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SppCommand {
    Start,
    Stop,
    Continue,
    SongPos,
}

/// Incoming 24-ppq clock tempo estimator
///
/// Averages over 72 pulses (3 beats); reports a new tempo only when the
/// estimate moves more than 1% away from the tracked value.
#[derive(Debug)]
pub struct ClockEstimator {
    count: u32,
    started: Option<Instant>,
    tempo: f32,
}

impl ClockEstimator {
    pub fn new(tempo: f32) -> Self {
        Self { count: 0, started: None, tempo }
    }

    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    pub fn reset(&mut self, tempo: f32) {
        self.count = 0;
        self.started = None;
        self.tempo = tempo;
    }

    /// Feed one clock pulse; returns the new tempo estimate when it
    /// differs from the tracked value by more than 1%
    pub fn pulse(&mut self) -> Option<f32> {
        self.count += 1;
        if self.count == 1 {
            self.started = Some(Instant::now());
            return None;
        }
        if self.count > 72 {
            self.count = 0;
            let elapsed_ms = self.started.take()?.elapsed().as_millis() as f32;
            return self.complete(elapsed_ms);
        }
        None
    }

    fn complete(&mut self, elapsed_ms: f32) -> Option<f32> {
        if elapsed_ms <= 0.0 {
            return None;
        }
        let tempo = (180_000.0 / elapsed_ms).floor();
        if (tempo - self.tempo).abs() / self.tempo > 0.01 {
            self.tempo = tempo;
            return Some(tempo);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_encode_known_vector() {
        // 15 minutes at 30 fps
        let data = mmc_locate_data(27000);
        assert_eq!(data, [0x01, 0x00, 0x0f, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_locate_round_trip() {
        for frame in [0u64, 1, 29, 30, 1799, 1800, 27000, 3600 * 30 * 127 + 12345] {
            let sysex = encode_mmc(0x7f, MmcCommand::Locate, &mmc_locate_data(frame));
            let ev = MmcEvent::decode(&sysex).expect("decodes");
            assert_eq!(ev.cmd, MmcCommand::Locate);
            assert_eq!(ev.locate(), Some(frame));
        }
    }

    #[test]
    fn test_decode_play_without_data() {
        // F0 7F 7F 06 02 F7: device 7F, command mode, PLAY
        let sysex = [0xf0, 0x7f, 0x7f, 0x06, 0x02, 0xf7];
        let ev = MmcEvent::decode(&sysex).expect("decodes");
        assert_eq!(ev.cmd, MmcCommand::Play);
        assert_eq!(ev.device, 0x7f);
        assert!(ev.data.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_mmc() {
        // Not command mode 0x06
        assert!(MmcEvent::decode(&[0xf0, 0x7f, 0x7f, 0x04, 0x01, 0xf7]).is_none());
        // Not a realtime sysex
        assert!(MmcEvent::decode(&[0xf0, 0x43, 0x10, 0x06, 0x02, 0xf7]).is_none());
    }

    #[test]
    fn test_masked_write_round_trip() {
        for track in 0u16..30 {
            let data = mmc_masked_write_data(MmcSubCommand::TrackRecord, track, true);
            let sysex = encode_mmc(0x7f, MmcCommand::MaskedWrite, &data);
            let ev = MmcEvent::decode(&sysex).expect("decodes");
            let (scmd, got, on) = ev.masked_write().expect("masked write");
            assert_eq!(scmd, MmcSubCommand::TrackRecord);
            assert_eq!(got, track, "track {}", track);
            assert!(on);
        }
    }

    #[test]
    fn test_masked_write_group_layout() {
        // Tracks 0 and 1 live in group 0 at bits 5 and 6
        assert_eq!(mmc_masked_write_data(MmcSubCommand::TrackMute, 0, true)[1], 0);
        assert_eq!(mmc_masked_write_data(MmcSubCommand::TrackMute, 0, true)[2], 1 << 5);
        assert_eq!(mmc_masked_write_data(MmcSubCommand::TrackMute, 1, true)[2], 1 << 6);
        // Track 2 starts group 1 at bit 0
        let d = mmc_masked_write_data(MmcSubCommand::TrackMute, 2, false);
        assert_eq!(d[1], 1);
        assert_eq!(d[2], 1);
        assert_eq!(d[3], 0);
        // Track 9 starts group 2
        assert_eq!(mmc_masked_write_data(MmcSubCommand::TrackMute, 9, true)[1], 2);
    }

    #[test]
    fn test_clock_estimator_pulse_cadence() {
        let mut est = ClockEstimator::new(120.0);
        // First pulse arms the timer, the next 71 accumulate
        for _ in 0..72 {
            assert_eq!(est.pulse(), None);
        }
        // The 73rd completes a 3-beat average; anything near-instant
        // computes an estimate far off 120 and reports it
        std::thread::sleep(std::time::Duration::from_millis(5));
        let tempo = est.pulse().expect("tempo reported");
        assert!(tempo > 120.0);
        assert_eq!(est.tempo(), tempo);
    }

    #[test]
    fn test_clock_estimator_three_beat_math() {
        // 3 beats in 1500 ms is 120 BPM
        let mut est = ClockEstimator::new(100.0);
        assert_eq!(est.complete(1500.0), Some(120.0));
        assert_eq!(est.tempo(), 120.0);
    }

    #[test]
    fn test_clock_estimator_ignores_small_drift() {
        let mut est = ClockEstimator::new(120.0);
        // 1490 ms -> 120.8 -> floor 120, within 1% of tracked
        assert_eq!(est.complete(1490.0), None);
        assert_eq!(est.tempo(), 120.0);
        // A real change gets through
        assert_eq!(est.complete(2000.0), Some(90.0));
    }
}
