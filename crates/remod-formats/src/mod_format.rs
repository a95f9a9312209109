//! ProTracker MOD format: data model, DMF conversion, and export.
//!
//! Conversion walks the DMF's generated state timeline row by row,
//! resolving each channel's note against the sample map and competing for
//! the single MOD effect slot per channel. Export writes the fixed
//! big-endian MOD layout: header, 31 sample info blocks, order table,
//! packed pattern stream, then sample PCM.
//!
//! Several limitations apply: the DMF must use the Game Boy system,
//! patterns must have 64 or fewer rows, and the pattern matrix must fit
//! MOD's 64 orders (63 with the setup pattern).

use std::collections::BTreeMap;
use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, info};

use remod_ir::{
    channel, convert_error, export_error, global, position, Category, ChannelIndex, ChannelState,
    ConversionOptions, DataFlags, ModuleError, ModuleFormat, NoteSlot, OptionDefinition,
    OptionValue, OrcData, PortamentoKind, RowIndex, StateReader, Status,
    GENERATE_LOOPBACK_ORDER_NEEDED,
};

use crate::dmf_format::{DmfModule, DmfSoundIndex, SystemType, GAME_BOY_VOLUME_MAX};
use crate::sample_mapper::{
    silence_sample, square_wave_sample, wavetable_sample, NoteRange, NoteRangeName, SampleMapper,
    SampleType,
};
use crate::tempo::{compat_tempo, tempo_and_speed, TempoWarning};

/// Highest MOD channel volume. There are 65 distinct values.
pub const VOLUME_MAX: u8 = 64;

const NUM_CHANNELS: ChannelIndex = 4;
const MOD_ROWS: RowIndex = 64;

/// ProTracker effect codes.
///
/// An effect occupies 12 bits on disk: three nibbles `[e][x][y]`. The
/// code is `[e]` or `[e][x]` and the value is `[x][y]` or `[y]`; codes of
/// the form `[e]` are stored here as `[e]0`.
pub mod pt_effect {
    pub const NONE: u16 = 0x00;
    pub const ARP: u16 = 0x00;
    pub const PORT_UP: u16 = 0x10;
    pub const PORT_DOWN: u16 = 0x20;
    pub const PORT2NOTE: u16 = 0x30;
    pub const VIBRATO: u16 = 0x40;
    pub const PORT2NOTE_VOL_SLIDE: u16 = 0x50;
    pub const VIBRATO_VOL_SLIDE: u16 = 0x60;
    pub const TREMOLO: u16 = 0x70;
    pub const PANNING: u16 = 0x80;
    pub const SET_SAMPLE_OFFSET: u16 = 0x90;
    pub const VOL_SLIDE: u16 = 0xA0;
    pub const POS_JUMP: u16 = 0xB0;
    pub const SET_VOLUME: u16 = 0xC0;
    pub const PAT_BREAK: u16 = 0xD0;
    pub const SET_FILTER: u16 = 0xE0;
    pub const FINE_SLIDE_UP: u16 = 0xE1;
    pub const FINE_SLIDE_DOWN: u16 = 0xE2;
    pub const SET_GLISSANDO: u16 = 0xE3;
    pub const SET_VIBRATO_WAVEFORM: u16 = 0xE4;
    pub const SET_FINETUNE: u16 = 0xE5;
    pub const LOOP_PATTERN: u16 = 0xE6;
    pub const SET_TREMOLO_WAVEFORM: u16 = 0xE7;
    pub const RETRIGGER_SAMPLE: u16 = 0xE9;
    pub const FINE_VOL_SLIDE_UP: u16 = 0xEA;
    pub const FINE_VOL_SLIDE_DOWN: u16 = 0xEB;
    pub const CUT_SAMPLE: u16 = 0xEC;
    pub const DELAY_SAMPLE: u16 = 0xED;
    pub const DELAY_PATTERN: u16 = 0xEE;
    pub const INVERT_LOOP: u16 = 0xEF;
    pub const SET_SPEED: u16 = 0xF0;
}

/// Amiga period table, octaves 0-4. ProTracker's standard range is
/// octaves 1-3; 0 and 4 exist but not every player handles them.
pub const PERIOD_TABLE: [[u16; 12]; 5] = [
    [1712, 1616, 1525, 1440, 1357, 1281, 1209, 1141, 1077, 1017, 961, 907],
    [856, 808, 762, 720, 678, 640, 604, 570, 538, 508, 480, 453],
    [428, 404, 381, 360, 339, 320, 302, 285, 269, 254, 240, 226],
    [214, 202, 190, 180, 170, 160, 151, 143, 135, 127, 120, 113],
    [107, 101, 95, 90, 85, 80, 76, 71, 67, 64, 60, 57],
];

/// One MOD pattern cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModRow {
    /// Sample number, 0-31; 0 keeps the previous sample
    pub sample: u8,
    /// Amiga period, 12 bits; 0 means no note
    pub period: u16,
    /// Effect code as `[e][x]` (see [`pt_effect`])
    pub effect_code: u16,
    /// Effect value: `[x][y]` for single-nibble codes, `[y]` for `E?`
    pub effect_value: u16,
}

/// Pack a cell into its four on-disk bytes.
pub fn pack_row(row: &ModRow) -> [u8; 4] {
    let effect = (((row.effect_code as u32) << 4) | row.effect_value as u32) & 0xFFF;
    [
        (row.sample & 0xF0) | ((row.period >> 8) as u8 & 0x0F),
        (row.period & 0xFF) as u8,
        ((row.sample & 0x0F) << 4) | ((effect >> 8) as u8 & 0x0F),
        (effect & 0xFF) as u8,
    ]
}

/// Unpack four on-disk bytes into a cell.
pub fn unpack_row(bytes: [u8; 4]) -> ModRow {
    let sample = (bytes[0] & 0xF0) | (bytes[2] >> 4);
    let period = (((bytes[0] & 0x0F) as u16) << 8) | bytes[1] as u16;
    let effect = (((bytes[2] & 0x0F) as u16) << 8) | bytes[3] as u16;
    let (effect_code, effect_value) = if effect >> 8 == 0xE {
        (0xE0 | ((effect >> 4) & 0x0F), effect & 0x0F)
    } else {
        ((effect >> 8) << 4, effect & 0xFF)
    };
    ModRow { sample, period, effect_code, effect_value }
}

/// One MOD sample slot.
#[derive(Clone, Debug, Default)]
pub struct ModSample {
    /// At most 22 characters
    pub name: String,
    pub id: u8,
    /// Length in bytes (stored on disk in words)
    pub length: u32,
    pub finetune: i8,
    pub volume: u8,
    pub repeat_offset: u32,
    pub repeat_length: u32,
    pub data: Vec<i8>,
}

#[derive(Clone, Debug, Default)]
pub struct ModGlobalData {
    pub title: String,
}

/// Type bundle for [`OrcData`].
#[derive(Debug)]
pub struct ModFormat;

impl ModuleFormat for ModFormat {
    type Row = ModRow;
    type ChannelMetadata = ();
    type PatternMetadata = ();
    type GlobalData = ModGlobalData;
}

/// A ProTracker module.
#[derive(Debug, Default)]
pub struct ModModule {
    pub data: OrcData<ModFormat>,
    pub samples: BTreeMap<u8, ModSample>,
    pub status: Status,
    total_mod_samples: u8,
}

/// MOD-specific convert error codes.
pub mod mod_convert_error {
    pub const NOT_GAME_BOY: i32 = 1;
    pub const TOO_MANY_PATTERN_MATRIX_ROWS: i32 = 2;
    pub const OVER_64_ROW_PATTERN: i32 = 3;
    pub const WRONG_CHANNEL_COUNT: i32 = 4;
    pub const WAVE_DOWNSAMPLE: i32 = 5;
    pub const TOO_MANY_SAMPLES: i32 = 6;
}

/// Warnings a DMF conversion can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvertWarning {
    PitchHigh,
    TempoLow,
    TempoHigh,
    TempoPrecision,
    EffectIgnored,
    MultipleEffects,
    LoopbackInaccuracy,
}

fn warning_text(warning: ConvertWarning) -> &'static str {
    match warning {
        ConvertWarning::PitchHigh => {
            "Cannot use the highest Deflemask note (C-8) on some MOD players including ProTracker."
        }
        ConvertWarning::TempoLow => {
            "Tempo is too low for ProTracker. Using the lowest supported value instead."
        }
        ConvertWarning::TempoHigh => {
            "Tempo is too high for ProTracker. Using the highest supported value instead."
        }
        ConvertWarning::TempoPrecision => {
            "Tempo does not exactly match, but the closest possible value was used."
        }
        ConvertWarning::EffectIgnored => {
            "A Deflemask effect was ignored due to limitations of the MOD format."
        }
        ConvertWarning::MultipleEffects => {
            "More than one effect was needed in the same row of the same channel."
        }
        ConvertWarning::LoopbackInaccuracy => {
            "The song loops back to a point where a note carries over; this will sound different in a MOD player."
        }
    }
}

/// Option table for DMF to MOD conversion.
pub fn option_definitions() -> Vec<OptionDefinition> {
    vec![
        OptionDefinition::flag("arp", false, "Allow arpeggio effects in the output"),
        OptionDefinition::flag("port", false, "Allow portamento up/down effects in the output"),
        OptionDefinition::flag("port2note", false, "Allow portamento to note effects in the output"),
        OptionDefinition::flag("vib", false, "Allow vibrato effects in the output"),
        OptionDefinition {
            name: "tempo",
            default: OptionValue::Str("accuracy".to_string()),
            allowed: &["accuracy", "compat"],
            description: "Trade BPM accuracy against effect compatibility",
        },
        OptionDefinition::flag("downsample", false, "Allow wavetables to lose information through downsampling"),
    ]
}

/// A [`ConversionOptions`] populated with the MOD defaults.
pub fn default_options() -> ConversionOptions {
    ConversionOptions::from_definitions(&option_definitions())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempoMode {
    Accuracy,
    Compat,
}

/// Typed view over the MOD conversion options.
pub struct ModOptions<'a> {
    options: &'a ConversionOptions,
}

impl<'a> ModOptions<'a> {
    pub fn new(options: &'a ConversionOptions) -> Self {
        Self { options }
    }

    pub fn allow_arpeggio(&self) -> bool {
        self.options.get_bool("arp").unwrap_or(false)
    }

    pub fn allow_portamento(&self) -> bool {
        self.options.get_bool("port").unwrap_or(false)
    }

    pub fn allow_port2note(&self) -> bool {
        self.options.get_bool("port2note").unwrap_or(false)
    }

    pub fn allow_vibrato(&self) -> bool {
        self.options.get_bool("vib").unwrap_or(false)
    }

    pub fn downsample(&self) -> bool {
        self.options.get_bool("downsample").unwrap_or(false)
    }

    pub fn tempo_mode(&self) -> TempoMode {
        match self.options.get_str("tempo") {
            Some("compat") => TempoMode::Compat,
            _ => TempoMode::Accuracy,
        }
    }
}

/// Convert a DMF channel volume (0-15) to a MOD volume (0-64).
fn mod_volume(dmf_volume: u8) -> u16 {
    ((dmf_volume as f64 / GAME_BOY_VOLUME_MAX as f64) * VOLUME_MAX as f64).round() as u16
}

/// Effect slot priority, highest first. Each channel row has exactly one
/// slot; lower-priority candidates are dropped. Sample changes need no
/// MOD effect and unsupported effects never get the slot, but both are
/// tracked through the same map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EffectPriority {
    Structure,
    SampleChange,
    Tempo,
    Volume,
    Other,
    Unsupported,
}

type Candidates = BTreeMap<EffectPriority, Vec<(u16, u16)>>;

fn push_candidate(candidates: &mut Candidates, priority: EffectPriority, effect: (u16, u16)) {
    candidates.entry(priority).or_default().push(effect);
}

/// What the emitter tracks per channel while walking the timeline.
struct ChannelEmitState {
    /// DMF-scale volume MOD is currently playing at
    volume: u8,
    note_playing: bool,
    sample_changed: bool,
    note_range: NoteRange,
}

impl Default for ChannelEmitState {
    fn default() -> Self {
        Self {
            volume: GAME_BOY_VOLUME_MAX,
            note_playing: false,
            sample_changed: false,
            note_range: NoteRange::First,
        }
    }
}

impl ModModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self) -> &str {
        &self.data.global().title
    }

    pub fn total_samples(&self) -> u8 {
        self.total_mod_samples
    }

    /// Convert a DMF module. Generates the DMF's state timeline first
    /// (cached on the DMF), then emits samples and patterns from it.
    pub fn from_dmf(dmf: &mut DmfModule, options: &ConversionOptions) -> Result<Self, ModuleError> {
        let mut module = ModModule::new();
        module.status.reset(Category::Convert);
        module.convert_from_dmf(dmf, options)?;
        Ok(module)
    }

    fn convert_from_dmf(
        &mut self,
        dmf: &mut DmfModule,
        options: &ConversionOptions,
    ) -> Result<(), ModuleError> {
        let opts = ModOptions::new(options);
        info!("starting to convert to MOD");

        if dmf.system().kind != SystemType::GameBoy {
            return Err(ModuleError::convert(
                mod_convert_error::NOT_GAME_BOY,
                "Only the Game Boy system is currently supported.",
            ));
        }
        if dmf.data.num_channels() != NUM_CHANNELS {
            return Err(ModuleError::convert(
                mod_convert_error::WRONG_CHANNEL_COUNT,
                "A Game Boy module must have 4 channels.",
            ));
        }

        // ProTracker stays closer to Deflemask's port-to-note behaviour,
        // so only ask for the MOD-accurate portamento state when those
        // effects will actually be emitted
        let mut flags = DataFlags::MOD_LOOPS;
        if opts.allow_port2note() {
            flags |= DataFlags::MOD_PORTAMENTOS;
        }
        let generate_status = dmf.generate_data(flags)?;
        if generate_status & GENERATE_LOOPBACK_ORDER_NEEDED != 0 {
            self.status.add_warning(warning_text(ConvertWarning::LoopbackInaccuracy));
        }

        let total_orders = dmf
            .generated()
            .total_orders
            .ok_or_else(|| ModuleError::convert(convert_error::UNSUCCESSFUL, "No generated data"))?;

        // The setup pattern carries the initial tempo, since MOD has no
        // header field for it
        let num_mod_orders = total_orders + 1;
        if num_mod_orders > 64 {
            return Err(ModuleError::convert(
                mod_convert_error::TOO_MANY_PATTERN_MATRIX_ROWS,
                "Too many rows of patterns in the pattern matrix. 64 is the maximum. (63 if using the setup pattern.)",
            ));
        }
        let num_rows = dmf.data.num_rows();
        if num_rows > MOD_ROWS {
            return Err(ModuleError::convert(
                mod_convert_error::OVER_64_ROW_PATTERN,
                "Patterns must have 64 or fewer rows.",
            ));
        }

        info!("converting samples");
        let sample_map = self.convert_samples(dmf, &opts)?;

        let (numerator, denominator) = dmf.bpm_fraction()?;
        let (tempo, speed, tempo_warning) = match opts.tempo_mode() {
            TempoMode::Accuracy => tempo_and_speed(numerator, denominator),
            TempoMode::Compat => compat_tempo(numerator as f64 / denominator as f64),
        };
        if let Some(w) = tempo_warning {
            self.status.add_warning(warning_text(match w {
                TempoWarning::Low => ConvertWarning::TempoLow,
                TempoWarning::High => ConvertWarning::TempoHigh,
                TempoWarning::Precision => ConvertWarning::TempoPrecision,
            }));
        }
        debug!("initial tempo {tempo}, speed {speed}");

        self.data.global_mut().title = dmf.title().chars().take(20).collect();
        self.data.allocate_pattern_matrix(NUM_CHANNELS, num_mod_orders, MOD_ROWS);
        for order in 0..num_mod_orders {
            self.data.set_pattern_id(order, order);
        }
        self.data.allocate_channels();
        self.data.allocate_patterns();

        // Setup pattern: tempo, speed, then straight on to the song
        self.data.set_row(0, 0, 0, effect_only(pt_effect::SET_SPEED, tempo as u16));
        self.data.set_row(0, 0, 1, effect_only(pt_effect::SET_SPEED, speed as u16));
        self.data.set_row(0, 0, 2, effect_only(pt_effect::PAT_BREAK, 0));

        info!("converting pattern data");
        self.convert_patterns(dmf, &opts, &sample_map)?;

        info!("done converting to MOD");
        Ok(())
    }

    /// Build the sample map from the generated note extremes and
    /// synthesize the PCM for every MOD sample slot it assigns.
    fn convert_samples(
        &mut self,
        dmf: &DmfModule,
        opts: &ModOptions,
    ) -> Result<BTreeMap<DmfSoundIndex, SampleMapper>, ModuleError> {
        let gen = dmf.generated();
        let state = gen
            .state
            .as_ref()
            .ok_or_else(|| ModuleError::convert(convert_error::UNSUCCESSFUL, "No generated data"))?;

        // A note off or a full note cut silences a channel, which MOD can
        // only do by playing a silent sample
        let silence_needed = gen.note_off_used == Some(true)
            || state
                .channels
                .iter()
                .any(|c| c.note_cut.iter().any(|&(_, value)| value == 0));

        let mut sample_map = BTreeMap::new();
        let mut next_id: u8 = 1;
        if silence_needed {
            let (mapper, next) = SampleMapper::init_silence();
            sample_map.insert(DmfSoundIndex::None, mapper);
            next_id = next;
        }

        let extremes = gen.sound_index_note_extremes.as_ref().cloned().unwrap_or_default();
        if let Some(used) = gen.sound_indexes_used.as_ref() {
            for &sound_index in used {
                let Some(&(lowest, highest)) = extremes.get(&sound_index) else {
                    continue;
                };
                let (mapper, next) = SampleMapper::init(sound_index, next_id, lowest, highest);
                if next as u32 - 1 > 31 {
                    return Err(ModuleError::convert(
                        mod_convert_error::TOO_MANY_SAMPLES,
                        "Too many MOD samples are needed; only 31 fit in a MOD file.",
                    ));
                }
                if mapper.downsampling_needed() && !opts.downsample() {
                    let which = match sound_index {
                        DmfSoundIndex::Wave(i) => i.to_string(),
                        _ => String::new(),
                    };
                    return Err(ModuleError::convert(
                        mod_convert_error::WAVE_DOWNSAMPLE,
                        format!(
                            "Cannot use wavetable instrument #{which} without loss of information.\n       Try using the 'downsample' option."
                        ),
                    ));
                }
                next_id = next;
                sample_map.insert(sound_index, mapper);
            }
        }

        self.total_mod_samples = next_id - 1;

        const RANGES: [NoteRange; 3] = [NoteRange::First, NoteRange::Second, NoteRange::Third];
        for mapper in sample_map.values() {
            for &range in &RANGES[..mapper.num_mod_samples()] {
                let id = mapper.mod_sample_id(range);
                let length = mapper.mod_sample_length(range);

                let (mut name, volume, data) = match mapper.sample_type() {
                    SampleType::Silence => {
                        ("Silence".to_string(), 0, silence_sample(length))
                    }
                    SampleType::Square => {
                        let duty = match mapper.dmf_index() {
                            DmfSoundIndex::Square(duty) => duty,
                            _ => 0,
                        };
                        let name = format!(
                            "SQW, Duty {}",
                            ["12.5%", "25%", "50%", "75%"][duty as usize % 4]
                        );
                        (name, VOLUME_MAX, square_wave_sample(duty, length))
                    }
                    SampleType::Wave => {
                        let index = match mapper.dmf_index() {
                            DmfSoundIndex::Wave(index) => index,
                            _ => 0,
                        };
                        let values = dmf
                            .wavetables
                            .get(index as usize)
                            .map(|w| w.values.as_slice())
                            .unwrap_or(&[]);
                        (
                            format!("Wavetable #{index}"),
                            VOLUME_MAX,
                            wavetable_sample(values, length),
                        )
                    }
                };

                match mapper.range_name(range) {
                    NoteRangeName::None => {}
                    NoteRangeName::Low => name.push_str(" (low)"),
                    NoteRangeName::Middle => name.push_str(" (mid)"),
                    NoteRangeName::High => name.push_str(" (high)"),
                }
                debug_assert!(name.len() <= 22);

                self.samples.insert(
                    id,
                    ModSample {
                        name,
                        id,
                        length,
                        finetune: 0,
                        volume,
                        repeat_offset: 0,
                        repeat_length: length,
                        data,
                    },
                );
            }
        }

        Ok(sample_map)
    }

    fn convert_patterns(
        &mut self,
        dmf: &DmfModule,
        opts: &ModOptions,
        sample_map: &BTreeMap<DmfSoundIndex, SampleMapper>,
    ) -> Result<(), ModuleError> {
        let gen = dmf.generated();
        let state = gen
            .state
            .as_ref()
            .ok_or_else(|| ModuleError::convert(convert_error::UNSUCCESSFUL, "No generated data"))?;
        let total_orders = gen.total_orders.unwrap_or(0);
        let num_rows = dmf.data.num_rows();

        let mut readers = state.readers();
        let mut emit_states: Vec<ChannelEmitState> =
            (0..NUM_CHANNELS).map(|_| ChannelEmitState::default()).collect();

        // One-time warning latches so a busy module does not flood the
        // warning list
        let mut pitch_warned = false;
        let mut ignored_warned = false;
        let mut crowded_warned = false;

        for order in 0..total_orders {
            for row in 0..num_rows {
                readers.seek_all(position(order, row));

                // A structure effect is channel independent: whichever
                // channel has a free slot can carry it.
                let mut independent: Option<(u16, u16)> = None;
                if num_rows < MOD_ROWS && row + 1 == num_rows {
                    // Short patterns need an explicit break to the next
                    // order
                    independent = Some((pt_effect::PAT_BREAK, 0));
                }
                if let Some(&dest) = readers.global.read_one_shot::<global::PosJump>() {
                    // Destination in MOD orders, past the setup pattern
                    independent = Some((pt_effect::POS_JUMP, dest + 1));
                } else if readers.global.read_one_shot::<global::PatBreak>().is_some() {
                    independent = Some((pt_effect::PAT_BREAK, 0));
                }

                for ch in 0..NUM_CHANNELS {
                    let value = emit_channel_row(
                        &mut readers.channels[ch as usize],
                        &mut emit_states[ch as usize],
                        opts,
                        sample_map,
                        &mut self.status,
                        &mut independent,
                        &mut pitch_warned,
                        &mut ignored_warned,
                    )?;
                    self.data.set_row(ch, order + 1, row, value);
                }

                if independent.is_some() && !crowded_warned {
                    self.status.add_warning(warning_text(ConvertWarning::MultipleEffects));
                    crowded_warned = true;
                }
            }
        }

        Ok(())
    }

    /// Serialize the module in the fixed MOD byte layout.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // 20-byte title, zero padded
        let title = self.data.global().title.as_bytes();
        for i in 0..20 {
            writer.write_u8(title.get(i).copied().unwrap_or(0))?;
        }

        // 31 sample info blocks of 30 bytes each. Sizes are in words.
        for id in 1..=31u8 {
            match self.samples.get(&id) {
                Some(sample) => {
                    let mut name = sample.name.clone().into_bytes();
                    name.truncate(22);
                    name.resize(22, b' ');
                    writer.write_all(&name)?;
                    writer.write_u16::<BigEndian>((sample.length / 2) as u16)?;
                    writer.write_u8(sample.finetune as u8)?;
                    writer.write_u8(sample.volume)?;
                    writer.write_u16::<BigEndian>((sample.repeat_offset / 2) as u16)?;
                    writer.write_u16::<BigEndian>((sample.repeat_length / 2) as u16)?;
                }
                None => {
                    // Unused slots: 29 zero bytes and a 0x01 tail byte,
                    // as real ProTracker files have
                    writer.write_all(&[0u8; 29])?;
                    writer.write_u8(1)?;
                }
            }
        }

        // Song length, a fixed 0x7F, the order table, and the signature.
        // "M!K!" would be needed past 64 patterns, which cannot happen.
        writer.write_u8(self.data.num_orders() as u8)?;
        writer.write_u8(0x7F)?;
        for order in 0..128 {
            let pattern = if order < self.data.num_orders() {
                self.data.pattern_id(order) as u8
            } else {
                0
            };
            writer.write_u8(pattern)?;
        }
        writer.write_all(b"M.K.")?;

        for pattern_id in 0..self.data.num_patterns() {
            for row in 0..self.data.num_rows() {
                for ch in 0..self.data.num_channels() {
                    writer.write_all(&pack_row(self.data.row_by_id(ch, pattern_id, row)))?;
                }
            }
        }

        for sample in self.samples.values() {
            for &value in &sample.data {
                writer.write_i8(value)?;
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModuleError> {
        let mut bytes = Vec::new();
        self.write(&mut bytes).map_err(|e| {
            ModuleError::export(export_error::FILE_OPEN, format!("Failed to write MOD data: {e}"))
        })?;
        Ok(bytes)
    }
}

fn effect_only(effect_code: u16, effect_value: u16) -> ModRow {
    ModRow { sample: 0, period: 0, effect_code, effect_value }
}

fn silent_sample_id(sample_map: &BTreeMap<DmfSoundIndex, SampleMapper>) -> u8 {
    sample_map
        .get(&DmfSoundIndex::None)
        .map(|m| m.first_mod_sample_id())
        .unwrap_or(1)
}

/// Emit one channel's MOD row from the timeline readers, which must
/// already be sought to the row's position.
#[allow(clippy::too_many_arguments)]
fn emit_channel_row(
    reader: &mut StateReader<'_, ChannelState<DmfSoundIndex>>,
    emit: &mut ChannelEmitState,
    opts: &ModOptions,
    sample_map: &BTreeMap<DmfSoundIndex, SampleMapper>,
    status: &mut Status,
    independent: &mut Option<(u16, u16)>,
    pitch_warned: &mut bool,
    ignored_warned: &mut bool,
) -> Result<ModRow, ModuleError> {
    let mut candidates = Candidates::new();

    // A sound index change means the next note plays a different sample.
    // No MOD effect is spent on it, but it competes in the map so the
    // bookkeeping mirrors the row's full demands.
    if reader.delta::<channel::SoundIndex>() {
        emit.sample_changed = true;
        push_candidate(&mut candidates, EffectPriority::SampleChange, (pt_effect::NONE, 0));
    }

    // Continuous effects have to be written on every MOD row while the
    // DMF state keeps them active. Ones the options exclude still enter
    // the map as unsupported so the warning fires.
    let port = *reader.read::<channel::Port>();
    if port.kind != PortamentoKind::None {
        let (code, allowed) = match port.kind {
            PortamentoKind::Up => (pt_effect::PORT_UP, opts.allow_portamento()),
            PortamentoKind::Down => (pt_effect::PORT_DOWN, opts.allow_portamento()),
            PortamentoKind::ToNote => (pt_effect::PORT2NOTE, opts.allow_port2note()),
            PortamentoKind::None => unreachable!(),
        };
        let priority = if allowed { EffectPriority::Other } else { EffectPriority::Unsupported };
        push_candidate(&mut candidates, priority, (code, port.value as u16));
    }
    let arp = *reader.read::<channel::Arp>();
    if arp != 0 {
        let priority =
            if opts.allow_arpeggio() { EffectPriority::Other } else { EffectPriority::Unsupported };
        push_candidate(&mut candidates, priority, (pt_effect::ARP, arp as u16));
    }
    let vibrato = *reader.read::<channel::Vibrato>();
    if vibrato != 0 {
        let priority =
            if opts.allow_vibrato() { EffectPriority::Other } else { EffectPriority::Unsupported };
        push_candidate(&mut candidates, priority, (pt_effect::VIBRATO, vibrato as u16));
    }

    if let Some(&value) = reader.read_one_shot::<channel::Retrigger>() {
        push_candidate(
            &mut candidates,
            EffectPriority::Other,
            (pt_effect::RETRIGGER_SAMPLE, (value & 0x0F) as u16),
        );
    }
    if let Some(&value) = reader.read_one_shot::<channel::NoteDelay>() {
        push_candidate(
            &mut candidates,
            EffectPriority::Other,
            (pt_effect::DELAY_SAMPLE, (value & 0x0F) as u16),
        );
    }
    // A cut at tick 0 silences the row outright and is handled as a
    // sample change rather than an effect
    let mut cut_now = false;
    if let Some(&value) = reader.read_one_shot::<channel::NoteCut>() {
        if value == 0 {
            cut_now = true;
        } else {
            push_candidate(
                &mut candidates,
                EffectPriority::Other,
                (pt_effect::CUT_SAMPLE, (value & 0x0F) as u16),
            );
        }
    }

    // Volume column changes
    let volume = *reader.read::<channel::Volume>();
    if reader.delta::<channel::Volume>() && volume != emit.volume {
        push_candidate(&mut candidates, EffectPriority::Volume, (pt_effect::SET_VOLUME, mod_volume(volume)));
        emit.volume = volume;
    }

    // Resolve the note
    let mut sample = 0u8;
    let mut period = 0u16;
    let note_event = reader.read_impulse::<channel::NoteCell>().copied();

    if cut_now {
        sample = silent_sample_id(sample_map);
        emit.note_playing = false;
    } else {
        match note_event {
            None | Some(NoteSlot::Empty) => {
                // Nothing new; sample 0 keeps the previous sample and
                // volume running
            }
            Some(NoteSlot::Off) => {
                sample = silent_sample_id(sample_map);
                emit.note_playing = false;
            }
            Some(NoteSlot::Note(note)) => {
                let sound_index = *reader.read::<channel::SoundIndex>();
                let mapper = sample_map.get(&sound_index).ok_or_else(|| {
                    ModuleError::convert(
                        convert_error::UNSUCCESSFUL,
                        "A necessary DMF sample was not in the sample map.",
                    )
                })?;

                let (mod_note, range) = mapper.mod_note(note);
                if range != emit.note_range {
                    // A different note range means a different MOD sample
                    emit.sample_changed = true;
                    emit.note_range = range;
                }
                if (mod_note.octave == 0 || mod_note.octave == 4) && !*pitch_warned {
                    status.add_warning(warning_text(ConvertWarning::PitchHigh));
                    *pitch_warned = true;
                }
                period = PERIOD_TABLE[mod_note.octave as usize][mod_note.pitch as usize];

                if emit.sample_changed || !emit.note_playing {
                    sample = mapper.mod_sample_id(range);
                    emit.sample_changed = false;

                    // Naming a sample resets the channel volume to the
                    // sample's default, so restore the channel volume
                    if !candidates.contains_key(&EffectPriority::Volume)
                        && emit.volume != GAME_BOY_VOLUME_MAX
                    {
                        push_candidate(
                            &mut candidates,
                            EffectPriority::Volume,
                            (pt_effect::SET_VOLUME, mod_volume(emit.volume)),
                        );
                    }
                } else {
                    // Keep the previous sample number so the volume is
                    // not reset
                    sample = 0;
                }
                emit.note_playing = true;
            }
        }
    }

    // One effect slot per channel. A channel whose slot is otherwise
    // free takes the deferred structure effect; structure wins the slot
    // outright when present.
    let slot_free = !candidates
        .keys()
        .any(|&p| p != EffectPriority::SampleChange && p != EffectPriority::Unsupported);
    if slot_free {
        if let Some(effect) = independent.take() {
            push_candidate(&mut candidates, EffectPriority::Structure, effect);
        }
    }

    // Pick the highest-priority usable candidate. Sample changes need no
    // effect and unsupported ones never get the slot.
    let mut chosen: Option<(u16, u16)> = None;
    let mut dropped = 0usize;
    for (&priority, list) in &candidates {
        if priority == EffectPriority::SampleChange {
            continue;
        }
        if priority == EffectPriority::Unsupported {
            dropped += list.len();
            continue;
        }
        for &candidate in list {
            if chosen.is_none() {
                chosen = Some(candidate);
            } else {
                dropped += 1;
            }
        }
    }
    if dropped > 0 && !*ignored_warned {
        status.add_warning(warning_text(ConvertWarning::EffectIgnored));
        *ignored_warned = true;
    }

    let (effect_code, effect_value) = chosen.unwrap_or((pt_effect::NONE, 0));
    Ok(ModRow { sample, period, effect_code, effect_value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pack_set_volume_row() {
        // Sample 5 playing C-2 at full volume
        let row = ModRow {
            sample: 5,
            period: 428,
            effect_code: pt_effect::SET_VOLUME,
            effect_value: 0x40,
        };
        assert_eq!(pack_row(&row), [0x01, 0xAC, 0x5C, 0x40]);
    }

    #[test]
    fn pack_row_round_trips() {
        let codes_and_values: &[(u16, u16)] = &[
            (pt_effect::NONE, 0),
            (pt_effect::PORT_UP, 0xFF),
            (pt_effect::PORT2NOTE, 0x12),
            (pt_effect::POS_JUMP, 0x3F),
            (pt_effect::SET_VOLUME, 0x40),
            (pt_effect::PAT_BREAK, 0),
            (pt_effect::RETRIGGER_SAMPLE, 0x3),
            (pt_effect::CUT_SAMPLE, 0xF),
            (pt_effect::DELAY_SAMPLE, 0x1),
            (pt_effect::SET_SPEED, 0xFF),
        ];
        for sample in 0..=31u8 {
            for &period in &[0u16, 113, 428, 856, 1712, 0xFFF] {
                for &(code, value) in codes_and_values {
                    let row = ModRow { sample, period, effect_code: code, effect_value: value };
                    assert_eq!(unpack_row(pack_row(&row)), row, "sample {sample} period {period} code {code:#x}");
                }
            }
        }
    }

    #[test]
    fn period_table_reference_points() {
        assert_eq!(PERIOD_TABLE[1][0], 856); // C-1
        assert_eq!(PERIOD_TABLE[2][0], 428); // C-2
        assert_eq!(PERIOD_TABLE[3][11], 113); // B-3
        assert_eq!(PERIOD_TABLE[0][0], 1712);
        assert_eq!(PERIOD_TABLE[4][11], 57);
    }

    #[test]
    fn mod_volume_scaling() {
        assert_eq!(mod_volume(0), 0);
        assert_eq!(mod_volume(15), 64);
        assert_eq!(mod_volume(5), 21);
    }

    #[test]
    fn export_layout_offsets() {
        let mut module = ModModule::new();
        module.data.global_mut().title = "layout test".to_string();
        module.data.allocate_pattern_matrix(4, 2, 64);
        module.data.set_pattern_id(0, 0);
        module.data.set_pattern_id(1, 1);
        module.data.allocate_channels();
        module.data.allocate_patterns();
        module.samples.insert(
            1,
            ModSample {
                name: "Silence".to_string(),
                id: 1,
                length: 8,
                finetune: 0,
                volume: 0,
                repeat_offset: 0,
                repeat_length: 8,
                data: vec![0; 8],
            },
        );

        let bytes = module.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1084 + 2 * 64 * 4 * 4 + 8);

        // Title
        assert_eq!(&bytes[0..11], b"layout test");
        assert_eq!(bytes[19], 0);
        // First sample block: name padded with spaces, length in words
        assert_eq!(&bytes[20..27], b"Silence");
        assert_eq!(bytes[27], b' ');
        assert_eq!(u16::from_be_bytes([bytes[42], bytes[43]]), 4);
        // Second (blank) sample block: 29 zeros and a 0x01 tail
        assert!(bytes[50..79].iter().all(|&b| b == 0));
        assert_eq!(bytes[79], 1);
        // Song structure
        assert_eq!(bytes[950], 2);
        assert_eq!(bytes[951], 0x7F);
        assert_eq!(bytes[952], 0);
        assert_eq!(bytes[953], 1);
        assert_eq!(bytes[954], 0);
        assert_eq!(&bytes[1080..1084], b"M.K.");
    }

    #[test]
    fn default_options_match_table() {
        let options = default_options();
        let opts = ModOptions::new(&options);
        assert!(!opts.allow_arpeggio());
        assert!(!opts.allow_portamento());
        assert!(!opts.allow_port2note());
        assert!(!opts.allow_vibrato());
        assert!(!opts.downsample());
        assert_eq!(opts.tempo_mode(), TempoMode::Accuracy);
    }

    #[test]
    fn effect_priority_ordering() {
        assert!(EffectPriority::Structure < EffectPriority::SampleChange);
        assert!(EffectPriority::Volume < EffectPriority::Other);
        assert!(EffectPriority::Other < EffectPriority::Unsupported);
    }
}
