//! DMF importer tests against in-memory zlib fixtures.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use remod_formats::{DmfModule, SystemType};
use remod_ir::{effects, NotePitch, NoteSlot};

/// Builds the inflated DMF payload section by section, then compresses.
struct DmfBuilder {
    payload: Vec<u8>,
}

impl DmfBuilder {
    fn new(version: u8, system: u8) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(b".DelekDefleMask.");
        payload.push(version);
        payload.push(system);
        Self { payload }
    }

    fn visual_info(mut self, title: &str, author: &str) -> Self {
        self.payload.push(title.len() as u8);
        self.payload.extend_from_slice(title.as_bytes());
        self.payload.push(author.len() as u8);
        self.payload.extend_from_slice(author.as_bytes());
        self.payload.push(4); // highlight A
        self.payload.push(4); // highlight B
        self
    }

    /// Module info for a format version 24+ file (4-byte row count, no
    /// arpeggio tick byte).
    fn module_info(mut self, time_base: u8, t1: u8, t2: u8, rows: u32, orders: u8) -> Self {
        self.payload.push(time_base);
        self.payload.push(t1);
        self.payload.push(t2);
        self.payload.push(1); // frames mode: NTSC
        self.payload.push(0); // not using custom Hz
        self.payload.extend_from_slice(b"\0\0\0");
        self.payload.extend_from_slice(&rows.to_le_bytes());
        self.payload.push(orders);
        self
    }

    /// Pattern matrix values, `matrix[channel][order]` (no pattern names
    /// before version 25).
    fn pattern_matrix(mut self, matrix: &[&[u8]]) -> Self {
        for channel in matrix {
            self.payload.extend_from_slice(channel);
        }
        self
    }

    fn no_instruments(mut self) -> Self {
        self.payload.push(0);
        self
    }

    fn no_wavetables(mut self) -> Self {
        self.payload.push(0);
        self
    }

    /// Pattern data for one channel: the effect-column count followed by
    /// one block per order (the format repeats shared patterns).
    fn channel_patterns(mut self, effect_columns: u8, blocks: &[&[u8]]) -> Self {
        self.payload.push(effect_columns);
        for block in blocks {
            self.payload.extend_from_slice(block);
        }
        self
    }

    fn no_pcm_samples(mut self) -> Self {
        self.payload.push(0);
        self
    }

    fn build(self) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.payload).unwrap();
        encoder.finish().unwrap()
    }
}

/// One pattern row cell: note, volume, one effect column, instrument.
fn row_bytes(pitch: u16, octave: u16, volume: i16, effect: (i16, i16), instrument: i16) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&pitch.to_le_bytes());
    bytes.extend_from_slice(&octave.to_le_bytes());
    bytes.extend_from_slice(&volume.to_le_bytes());
    bytes.extend_from_slice(&effect.0.to_le_bytes());
    bytes.extend_from_slice(&effect.1.to_le_bytes());
    bytes.extend_from_slice(&instrument.to_le_bytes());
    bytes
}

fn empty_row() -> Vec<u8> {
    row_bytes(0, 0, -1, (-1, -1), -1)
}

fn empty_block(rows: usize) -> Vec<u8> {
    let mut block = Vec::new();
    for _ in 0..rows {
        block.extend_from_slice(&empty_row());
    }
    block
}

#[test]
fn imports_minimal_game_boy_module() {
    let block = empty_block(64);
    let bytes = DmfBuilder::new(0x18, 0x04)
        .visual_info("", "")
        .module_info(1, 6, 6, 64, 1)
        .pattern_matrix(&[&[0], &[0], &[0], &[0]])
        .no_instruments()
        .no_wavetables()
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .no_pcm_samples()
        .build();

    let module = DmfModule::from_bytes(&bytes).unwrap();
    assert_eq!(module.system().kind, SystemType::GameBoy);
    assert_eq!(module.data.num_channels(), 4);
    assert_eq!(module.data.num_orders(), 1);
    assert_eq!(module.data.num_rows(), 64);
    assert_eq!(module.title(), "");
    assert_eq!(module.data.global().format_version, 0x18);
    assert_eq!(module.data.global().global_tick, 60);

    // time base byte 1 is stored as 2: BPM = 15 * 60 / (2 * 12) = 37.5,
    // while the file byte 0 would give the classic 75
    assert!((module.bpm().unwrap() - 37.5).abs() < 1e-12);
}

#[test]
fn stored_time_base_is_file_value_plus_one() {
    let block = empty_block(4);
    let bytes = DmfBuilder::new(0x18, 0x04)
        .visual_info("t", "a")
        .module_info(0, 6, 6, 4, 1)
        .pattern_matrix(&[&[0], &[0], &[0], &[0]])
        .no_instruments()
        .no_wavetables()
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&block])
        .no_pcm_samples()
        .build();

    let module = DmfModule::from_bytes(&bytes).unwrap();
    assert_eq!(module.module_info.time_base, 1);
    assert!((module.bpm().unwrap() - 75.0).abs() < 1e-12);
    assert_eq!(module.title(), "t");
}

#[test]
fn shared_pattern_ids_are_read_once() {
    // Both orders use pattern 0 on every channel. The duplicate blocks
    // contain a different note, which must be skipped, leaving both
    // orders reading the first block's data.
    let mut first = row_bytes(0, 4, -1, (-1, -1), -1); // C-4
    first.extend_from_slice(&empty_block(3));
    let mut duplicate = row_bytes(9, 2, -1, (-1, -1), -1); // A-2, must be ignored
    duplicate.extend_from_slice(&empty_block(3));

    let bytes = DmfBuilder::new(0x18, 0x04)
        .visual_info("", "")
        .module_info(0, 6, 6, 4, 2)
        .pattern_matrix(&[&[0, 0], &[0, 0], &[0, 0], &[0, 0]])
        .no_instruments()
        .no_wavetables()
        .channel_patterns(1, &[&first, &duplicate])
        .channel_patterns(1, &[&first, &duplicate])
        .channel_patterns(1, &[&first, &duplicate])
        .channel_patterns(1, &[&first, &duplicate])
        .no_pcm_samples()
        .build();

    let module = DmfModule::from_bytes(&bytes).unwrap();
    for channel in 0..4 {
        assert_eq!(module.data.num_patterns(channel), 1);
        let expected = NoteSlot::Note(remod_ir::Note::new(NotePitch::C, 4));
        assert_eq!(module.data.row(channel, 0, 0).note, expected);
        // The second order shares the same backing rows
        assert_eq!(module.data.row(channel, 1, 0).note, expected);
    }
}

#[test]
fn decodes_note_quirks_and_effects() {
    // Pitch 12 is an alternate encoding of C in the next octave up, and
    // the Game Boy duty cycle effect is format-specific code 0x12
    let mut block = row_bytes(12, 3, 10, (0x12, 2), 0);
    block.extend_from_slice(&row_bytes(100, 0, -1, (0xB, 0), -1)); // note off + jump
    block.extend_from_slice(&empty_block(2));

    let bytes = DmfBuilder::new(0x18, 0x04)
        .visual_info("", "")
        .module_info(0, 6, 6, 4, 1)
        .pattern_matrix(&[&[0], &[0], &[0], &[0]])
        .no_instruments()
        .no_wavetables()
        .channel_patterns(1, &[&block])
        .channel_patterns(1, &[&empty_block(4)])
        .channel_patterns(1, &[&empty_block(4)])
        .channel_patterns(1, &[&empty_block(4)])
        .no_pcm_samples()
        .build();

    let module = DmfModule::from_bytes(&bytes).unwrap();
    let row = module.data.row(0, 0, 0);
    assert_eq!(row.note, NoteSlot::Note(remod_ir::Note::new(NotePitch::C, 4)));
    assert_eq!(row.volume, 10);
    assert_eq!(row.effects[0].code, remod_formats::dmf_effects::GAME_BOY_SET_DUTY_CYCLE);
    assert_eq!(row.effects[0].value, 2);
    assert_eq!(row.instrument, 0);

    let row = module.data.row(0, 0, 1);
    assert_eq!(row.note, NoteSlot::Off);
    assert_eq!(row.effects[0].code, effects::POS_JUMP);
}

#[test]
fn rejects_bad_magic_and_versions() {
    let garbage = {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b".NotDefleMask...restofdata").unwrap();
        encoder.finish().unwrap()
    };
    assert!(DmfModule::from_bytes(&garbage).is_err());

    // Version 16 is one below the supported minimum
    let old = DmfBuilder::new(16, 0x04).build();
    let error = DmfModule::from_bytes(&old).unwrap_err();
    assert!(error.message.contains("version"));

    // Unknown system byte
    let bad_system = DmfBuilder::new(0x18, 0x55).build();
    assert!(DmfModule::from_bytes(&bad_system).is_err());

    // Truncated streams surface as import errors too
    assert!(DmfModule::from_bytes(&[0x78, 0x9C]).is_err());
}
