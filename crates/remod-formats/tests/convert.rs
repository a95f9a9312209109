//! End-to-end DMF to MOD conversion tests.

use remod_formats::{
    default_mod_options, game_boy_channel, mod_convert_error, pt_effect, system_by_id, unpack_row,
    DmfModule, DmfRow, ModModule,
};
use remod_ir::{Effect, Note, NotePitch, NoteSlot, OptionValue};

/// A Game Boy DMF module with one pattern per channel per order.
fn game_boy_module(num_orders: u16, num_rows: u16) -> DmfModule {
    let mut module = DmfModule::new();
    module.module_info.time_base = 1;
    module.module_info.tick_time1 = 6;
    module.module_info.tick_time2 = 6;
    {
        let global = module.data.global_mut();
        global.system = system_by_id(0x04).unwrap();
        global.format_version = 24;
        global.global_tick = 60;
        global.title = "conversion test".to_string();
    }
    module.data.allocate_pattern_matrix(4, num_orders, num_rows);
    for channel in 0..4 {
        for order in 0..num_orders {
            module.data.set_pattern_id(channel, order, order);
        }
    }
    module.data.allocate_channels();
    module.data.allocate_patterns();
    module
}

fn note_row(pitch: NotePitch, octave: u8) -> DmfRow {
    DmfRow { note: NoteSlot::Note(Note::new(pitch, octave)), ..DmfRow::default() }
}

fn cell(bytes: &[u8], pattern: usize, row: usize, channel: usize) -> remod_formats::ModRow {
    let offset = 1084 + pattern * 64 * 4 * 4 + (row * 4 + channel) * 4;
    unpack_row([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

#[test]
fn converts_single_note_module() {
    let mut dmf = game_boy_module(1, 64);
    dmf.data.set_row(0, 0, 0, note_row(NotePitch::C, 4));

    let options = default_mod_options();
    let module = ModModule::from_dmf(&mut dmf, &options).unwrap();
    let bytes = module.to_bytes().unwrap();

    // Setup pattern plus one song pattern, one square sample of 64 bytes
    assert_eq!(bytes.len(), 1084 + 2 * 64 * 4 * 4 + 64);
    assert_eq!(&bytes[0..15], b"conversion test");
    assert_eq!(bytes[950], 2);
    assert_eq!(&bytes[1080..1084], b"M.K.");

    // Sample 1: the 12.5% duty square, full volume, length 32 words
    assert_eq!(&bytes[20..35], b"SQW, Duty 12.5%");
    assert_eq!(u16::from_be_bytes([bytes[42], bytes[43]]), 32);
    assert_eq!(bytes[45], 64);

    // Setup pattern carries tempo 250, speed 10 (75 BPM), then a break
    let tempo_row = cell(&bytes, 0, 0, 0);
    assert_eq!(tempo_row.effect_code, pt_effect::SET_SPEED);
    assert_eq!(tempo_row.effect_value, 250);
    let speed_row = cell(&bytes, 0, 1, 0);
    assert_eq!(speed_row.effect_code, pt_effect::SET_SPEED);
    assert_eq!(speed_row.effect_value, 10);
    let break_row = cell(&bytes, 0, 2, 0);
    assert_eq!(break_row.effect_code, pt_effect::PAT_BREAK);
    assert_eq!(break_row.effect_value, 0);

    // The note: C-4 shifts down two octaves into sample 1 at C-3
    let note_cell = cell(&bytes, 1, 0, 0);
    assert_eq!(note_cell.sample, 1);
    assert_eq!(note_cell.period, 214);

    // The song loops back past the setup pattern on its final row
    let last_cell = cell(&bytes, 1, 63, 0);
    assert_eq!(last_cell.effect_code, pt_effect::POS_JUMP);
    assert_eq!(last_cell.effect_value, 1);

    assert!(!module.status.error_occurred());
}

#[test]
fn note_off_brings_in_the_silent_sample() {
    let mut dmf = game_boy_module(1, 64);
    dmf.data.set_row(0, 0, 0, note_row(NotePitch::E, 3));
    let mut off = DmfRow::default();
    off.note = NoteSlot::Off;
    dmf.data.set_row(0, 0, 4, off);

    let options = default_mod_options();
    let module = ModModule::from_dmf(&mut dmf, &options).unwrap();
    assert_eq!(module.total_samples(), 2);
    assert_eq!(module.samples[&1].name, "Silence");
    assert_eq!(module.samples[&1].volume, 0);
    assert_eq!(module.samples[&1].length, 8);

    let bytes = module.to_bytes().unwrap();
    let off_cell = cell(&bytes, 1, 4, 0);
    assert_eq!(off_cell.sample, 1);
    assert_eq!(off_cell.period, 0);
}

#[test]
fn wave_downsampling_requires_consent() {
    let mut dmf = game_boy_module(1, 64);
    dmf.wavetables.push(remod_formats::Wavetable { values: vec![8; 32] });

    // A high wave note forces a short sample: C-5..B-7 needs 16 bytes
    let mut select_wave = DmfRow::default();
    select_wave.effects[0] = Effect::new(remod_formats::dmf_effects::GAME_BOY_SET_WAVE, 0);
    dmf.data.set_row(game_boy_channel::WAVE, 0, 0, select_wave);
    dmf.data.set_row(game_boy_channel::WAVE, 0, 1, note_row(NotePitch::C, 5));
    dmf.data.set_row(game_boy_channel::WAVE, 0, 2, note_row(NotePitch::B, 7));

    let options = default_mod_options();
    let error = ModModule::from_dmf(&mut dmf, &options).unwrap_err();
    assert_eq!(error.code, mod_convert_error::WAVE_DOWNSAMPLE);

    let mut options = default_mod_options();
    options
        .set(&remod_formats::option_definitions(), "downsample", OptionValue::Bool(true))
        .unwrap();
    let module = ModModule::from_dmf(&mut dmf, &options).unwrap();
    // 16-byte wave sample, downsampled from the 32-entry table
    assert_eq!(module.samples[&1].length, 16);
    assert!(module.samples[&1].name.starts_with("Wavetable #0"));
}

#[test]
fn too_many_orders_is_rejected() {
    let mut dmf = game_boy_module(64, 4);
    let options = default_mod_options();
    let error = ModModule::from_dmf(&mut dmf, &options).unwrap_err();
    assert_eq!(error.code, mod_convert_error::TOO_MANY_PATTERN_MATRIX_ROWS);
}

#[test]
fn short_patterns_get_a_break_on_their_last_row() {
    let mut dmf = game_boy_module(2, 16);
    dmf.data.set_row(0, 0, 0, note_row(NotePitch::A, 3));

    let options = default_mod_options();
    let module = ModModule::from_dmf(&mut dmf, &options).unwrap();
    let bytes = module.to_bytes().unwrap();

    // Row 15 of the first song pattern breaks to the next order
    let break_cell = cell(&bytes, 1, 15, 0);
    assert_eq!(break_cell.effect_code, pt_effect::PAT_BREAK);
    assert_eq!(break_cell.effect_value, 0);

    // Rows past the DMF's 16 stay blank
    let blank = cell(&bytes, 1, 20, 0);
    assert_eq!(blank, remod_formats::ModRow::default());
}

#[test]
fn volume_changes_emit_set_volume_effects() {
    let mut dmf = game_boy_module(1, 64);
    let mut quiet = note_row(NotePitch::C, 3);
    quiet.volume = 8;
    dmf.data.set_row(0, 0, 0, note_row(NotePitch::C, 3));
    dmf.data.set_row(0, 0, 8, quiet);

    let options = default_mod_options();
    let module = ModModule::from_dmf(&mut dmf, &options).unwrap();
    let bytes = module.to_bytes().unwrap();

    let quiet_cell = cell(&bytes, 1, 8, 0);
    assert_eq!(quiet_cell.effect_code, pt_effect::SET_VOLUME);
    // 8/15 of the MOD maximum, rounded
    assert_eq!(quiet_cell.effect_value, 34);
}
