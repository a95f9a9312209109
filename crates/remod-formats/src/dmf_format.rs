//! Deflemask DMF format: data model and importer.
//!
//! DMF files are zlib-compressed. The inflated payload is parsed strictly
//! forward (no seek table); section sizes come from earlier fields, and
//! many fields only exist for certain format versions or systems. Written
//! against the spec sheet at http://www.deflemask.com/DMF_SPECS.txt.

use std::io;

use byteorder::LittleEndian;
use flate2::read::ZlibDecoder;
use log::{debug, info};

use remod_ir::{
    effects, CorData, Effect, GeneratedData, ModuleError, ModuleFormat, Note, NotePitch, NoteSlot,
    OrderIndex, PatternIndex, RowIndex, Status,
};

use crate::reader::Reader;

/// Oldest supported DMF format version, 17 (0x11).
pub const FILE_VERSION_MIN: u8 = 17;
/// Newest supported DMF format version, 27 (0x1b).
pub const FILE_VERSION_MAX: u8 = 27;

/// Row volume meaning "no change".
pub const NO_VOLUME: i16 = -1;
/// Row instrument meaning "none".
pub const NO_INSTRUMENT: i16 = -1;
/// Highest volume on any Game Boy channel.
pub const GAME_BOY_VOLUME_MAX: u8 = 15;

/// DMF-specific effect codes (positive; see `remod_ir::effects` for the
/// common negative codes).
pub mod dmf_effects {
    use remod_ir::EffectCode;

    pub const ARP_TICK_SPEED: EffectCode = 1;
    pub const NOTE_SLIDE_UP: EffectCode = 2;
    pub const NOTE_SLIDE_DOWN: EffectCode = 3;
    pub const SET_VIBRATO_MODE: EffectCode = 4;
    pub const SET_FINE_VIBRATO_DEPTH: EffectCode = 5;
    pub const SET_FINETUNE: EffectCode = 6;
    pub const SET_SAMPLES_BANK: EffectCode = 7;
    pub const SYNC_SIGNAL: EffectCode = 8;
    pub const SET_GLOBAL_FINETUNE: EffectCode = 9;
    pub const GAME_BOY_SET_WAVE: EffectCode = 10;
    pub const GAME_BOY_SET_NOISE_POLY_COUNTER_MODE: EffectCode = 11;
    pub const GAME_BOY_SET_DUTY_CYCLE: EffectCode = 12;
    pub const GAME_BOY_SET_SWEEP_TIME_SHIFT: EffectCode = 13;
    pub const GAME_BOY_SET_SWEEP_DIR: EffectCode = 14;
}

/// Deflemask Game Boy channel layout.
pub mod game_boy_channel {
    pub const SQUARE_1: u8 = 0;
    pub const SQUARE_2: u8 = 1;
    pub const WAVE: u8 = 2;
    pub const NOISE: u8 = 3;
}

/// Systems Deflemask supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SystemType {
    #[default]
    Error,
    Ymu759,
    Genesis,
    GenesisCh3,
    Sms,
    SmsOpll,
    GameBoy,
    PcEngine,
    Nes,
    NesVrc7,
    C64Sid8580,
    C64Sid6581,
    Arcade,
    NeoGeo,
    NeoGeoCh2,
    NesFds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct System {
    pub kind: SystemType,
    pub id: u8,
    pub name: &'static str,
    pub channels: u8,
}

impl Default for System {
    fn default() -> Self {
        SYSTEMS[0]
    }
}

/// Every system, in table order. The error entry is first.
pub const SYSTEMS: &[System] = &[
    System { kind: SystemType::Error, id: 0x00, name: "ERROR", channels: 0 },
    System { kind: SystemType::Ymu759, id: 0x01, name: "YMU759", channels: 17 },
    System { kind: SystemType::Genesis, id: 0x02, name: "Genesis", channels: 10 },
    System { kind: SystemType::GenesisCh3, id: 0x42, name: "Genesis (Ext. CH3)", channels: 13 },
    System { kind: SystemType::Sms, id: 0x03, name: "SMS", channels: 4 },
    System { kind: SystemType::SmsOpll, id: 0x43, name: "SMS + OPLL", channels: 13 },
    System { kind: SystemType::GameBoy, id: 0x04, name: "Game Boy", channels: 4 },
    System { kind: SystemType::PcEngine, id: 0x05, name: "PC Engine", channels: 6 },
    System { kind: SystemType::Nes, id: 0x06, name: "NES", channels: 5 },
    System { kind: SystemType::NesVrc7, id: 0x46, name: "NES + VRC7", channels: 11 },
    System { kind: SystemType::C64Sid8580, id: 0x07, name: "C64 (SID 8580)", channels: 3 },
    System { kind: SystemType::C64Sid6581, id: 0x47, name: "C64 (SID 6581)", channels: 3 },
    System { kind: SystemType::Arcade, id: 0x08, name: "Arcade", channels: 13 },
    System { kind: SystemType::NeoGeo, id: 0x09, name: "Neo Geo", channels: 13 },
    System { kind: SystemType::NeoGeoCh2, id: 0x49, name: "Neo Geo (Ext. CH2)", channels: 16 },
    System { kind: SystemType::NesFds, id: 0x86, name: "NES + FDS", channels: 6 },
];

/// Look up a system by its file id byte.
pub fn system_by_id(id: u8) -> Option<System> {
    SYSTEMS[1..].iter().copied().find(|s| s.id == id)
}

/// Which timbre source a Game Boy channel plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DmfSoundIndex {
    #[default]
    None,
    /// Square duty cycle 0-3
    Square(u8),
    /// Wavetable index
    Wave(u8),
    /// Placeholder; the noise channel is not converted
    Noise(u8),
}

/// One DMF pattern row. Deflemask allows four effect columns per channel
/// regardless of system; unused columns are stored as no-effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmfRow {
    pub note: NoteSlot,
    pub volume: i16,
    pub effects: [Effect; 4],
    pub instrument: i16,
}

impl Default for DmfRow {
    fn default() -> Self {
        Self {
            note: NoteSlot::Empty,
            volume: NO_VOLUME,
            effects: [Effect::none(); 4],
            instrument: NO_INSTRUMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DmfChannelMetadata {
    /// Effect columns in use for this channel, 1-4.
    pub effect_columns: u8,
}

#[derive(Clone, Debug, Default)]
pub struct DmfPatternMetadata {
    /// Pattern name (format version 25+).
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct DmfGlobalData {
    pub title: String,
    pub author: String,
    pub format_version: u8,
    pub system: System,
    pub highlight_a: u8,
    pub highlight_b: u8,
    pub frames_mode: u8,
    /// Set when the module uses a custom refresh rate.
    pub custom_hz: Option<u16>,
    /// Refresh rate in Hz the module plays at.
    pub global_tick: u16,
}

/// Speed settings from the module info block.
#[derive(Clone, Copy, Debug, Default)]
pub struct DmfModuleInfo {
    /// Stored as the file byte plus one.
    pub time_base: u8,
    pub tick_time1: u8,
    pub tick_time2: u8,
}

#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub values: Vec<i32>,
    pub loop_pos: i8,
}

/// Game Boy hardware envelope settings (format version 18+).
#[derive(Clone, Copy, Debug, Default)]
pub struct GameBoyInstrumentData {
    pub env_vol: u8,
    pub env_dir: u8,
    pub env_len: u8,
    pub sound_len: u8,
}

/// Commodore 64 instrument block, kept only to round-trip the byte
/// stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct C64InstrumentData {
    pub tri_wave_en: u8,
    pub saw_wave_en: u8,
    pub pulse_wave_en: u8,
    pub noise_wave_en: u8,
    pub attack: u8,
    pub decay: u8,
    pub sustain: u8,
    pub release: u8,
    pub pulse_width: u8,
    pub ring_mod_en: u8,
    pub sync_mod_en: u8,
    pub to_filter: u8,
    pub vol_macro_to_filter_cutoff_en: u8,
    pub use_filter_values_from_inst: u8,
    pub filter_resonance: u8,
    pub filter_cutoff: u8,
    pub filter_high_pass: u8,
    pub filter_low_pass: u8,
    pub filter_ch2_off: u8,
}

#[derive(Clone, Debug, Default)]
pub struct StdInstrument {
    pub vol_env: Envelope,
    pub arp_env: Envelope,
    pub arp_macro_mode: u8,
    pub duty_noise_env: Envelope,
    pub wavetable_env: Envelope,
    pub c64: Option<C64InstrumentData>,
    pub game_boy: Option<GameBoyInstrumentData>,
}

/// One FM operator. Fields beyond the first twelve only exist in format
/// version 18 and older.
#[derive(Clone, Copy, Debug, Default)]
pub struct FmOperator {
    pub am: u8,
    pub ar: u8,
    pub dr: u8,
    pub mult: u8,
    pub rr: u8,
    pub sl: u8,
    pub tl: u8,
    pub dt2: u8,
    pub rs: u8,
    pub dt: u8,
    pub d2r: u8,
    /// SSG mode, or EG-S on SMS OPLL / NES VRC7.
    pub ssg_mode: u8,
    pub dam: u8,
    pub dvb: u8,
    pub egt: u8,
    pub ksl: u8,
    pub sus: u8,
    pub vib: u8,
    pub ws: u8,
    pub ksr: u8,
}

#[derive(Clone, Debug, Default)]
pub struct FmInstrument {
    pub num_operators: u8,
    /// ALG, or SUS on SMS OPLL / NES VRC7.
    pub alg: u8,
    pub fb: u8,
    pub opll_preset: u8,
    /// LFO, or DC on SMS OPLL / NES VRC7.
    pub lfo: u8,
    /// LFO2, or DM on SMS OPLL / NES VRC7.
    pub lfo2: u8,
    pub ops: [FmOperator; 4],
}

#[derive(Clone, Debug)]
pub enum InstrumentKind {
    Standard(StdInstrument),
    Fm(FmInstrument),
}

#[derive(Clone, Debug)]
pub struct Instrument {
    pub name: String,
    pub kind: InstrumentKind,
}

#[derive(Clone, Debug, Default)]
pub struct Wavetable {
    pub values: Vec<u32>,
}

/// A PCM sample. `cut_start`/`cut_end` exist in format version 27+; they
/// are validated and preserved but nothing downstream consumes them.
#[derive(Clone, Debug, Default)]
pub struct PcmSample {
    pub name: String,
    pub rate: u8,
    pub pitch: u8,
    pub amp: u8,
    pub bits: u8,
    pub cut_start: u32,
    pub cut_end: u32,
    pub data: Vec<u16>,
}

/// Type bundle for [`CorData`].
#[derive(Debug)]
pub struct DmfFormat;

impl ModuleFormat for DmfFormat {
    type Row = DmfRow;
    type ChannelMetadata = DmfChannelMetadata;
    type PatternMetadata = DmfPatternMetadata;
    type GlobalData = DmfGlobalData;
}

/// A decoded DMF module.
#[derive(Debug, Default)]
pub struct DmfModule {
    pub data: CorData<DmfFormat>,
    pub module_info: DmfModuleInfo,
    pub instruments: Vec<Instrument>,
    pub wavetables: Vec<Wavetable>,
    pub pcm_samples: Vec<PcmSample>,
    pub(crate) generated: GeneratedData<DmfSoundIndex>,
    pub status: Status,
}

impl DmfModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(&self) -> System {
        self.data.global().system
    }

    pub fn title(&self) -> &str {
        &self.data.global().title
    }

    pub fn generated(&self) -> &GeneratedData<DmfSoundIndex> {
        &self.generated
    }

    /// The module's initial BPM as a fraction. Derived from the refresh
    /// rate and speed settings; experimentally determined equation.
    pub fn bpm_fraction(&self) -> Result<(u32, u32), ModuleError> {
        let numerator = 15 * self.data.global().global_tick as u32;
        let denominator = self.module_info.time_base as u32
            * (self.module_info.tick_time1 as u32 + self.module_info.tick_time2 as u32);
        if denominator == 0 {
            return Err(ModuleError::convert(
                remod_ir::convert_error::UNSUCCESSFUL,
                "Tried to divide by zero when calculating BPM",
            ));
        }
        Ok((numerator, denominator))
    }

    pub fn bpm(&self) -> Result<f64, ModuleError> {
        let (n, d) = self.bpm_fraction()?;
        Ok(n as f64 / d as f64)
    }

    /// Parse a zlib-compressed DMF byte stream into this module,
    /// replacing any previous contents.
    pub fn import(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
        *self = DmfModule::default();
        let mut importer = Importer {
            reader: Reader::new(ZlibDecoder::new(bytes)),
            module: self,
        };
        importer.import()
    }

    /// Parse a zlib-compressed DMF byte stream into a new module.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModuleError> {
        let mut module = DmfModule::new();
        module.import(bytes)?;
        Ok(module)
    }
}

mod import_error {
    pub const UNSPECIFIED: i32 = 1;
}

fn io_err(err: io::Error) -> ModuleError {
    ModuleError::import(import_error::UNSPECIFIED, format!("Failed to read DMF data: {err}"))
}

struct Importer<'a> {
    reader: Reader<ZlibDecoder<&'a [u8]>, LittleEndian>,
    module: &'a mut DmfModule,
}

impl Importer<'_> {
    fn version(&self) -> u8 {
        self.module.data.global().format_version
    }

    fn system(&self) -> System {
        self.module.data.global().system
    }

    fn import(&mut self) -> Result<(), ModuleError> {
        debug!("starting DMF import");

        let header = self.reader.read_str(16).map_err(io_err)?;
        if header != ".DelekDefleMask." {
            return Err(ModuleError::import(
                import_error::UNSPECIFIED,
                "DMF format header is bad.",
            ));
        }

        let version = self.reader.read_u8().map_err(io_err)?;
        if !(FILE_VERSION_MIN..=FILE_VERSION_MAX).contains(&version) {
            let too_high = version > FILE_VERSION_MAX;
            let extreme = if too_high { FILE_VERSION_MAX } else { FILE_VERSION_MIN };
            let direction = if too_high { "lower" } else { "higher" };
            let remedy = if too_high {
                "remod needs to be updated to support this newer version."
            } else {
                "You can convert older DMF files to a supported version by opening them in a newer version of DefleMask and then saving them."
            };
            return Err(ModuleError::import(
                import_error::UNSPECIFIED,
                format!(
                    "Deflemask file version must be {extreme} (0x{extreme:02x}) or {direction}.\nThe given DMF file is version {version} (0x{version:02x}).\n       {remedy}"
                ),
            ));
        }
        self.module.data.global_mut().format_version = version;
        debug!("DMF version {version} (0x{version:02x})");

        let system_byte = self.reader.read_u8().map_err(io_err)?;
        let system = system_by_id(system_byte).ok_or_else(|| {
            ModuleError::import(import_error::UNSPECIFIED, "Invalid system type")
        })?;
        self.module.data.global_mut().system = system;
        info!("system: {} (channels: {})", system.name, system.channels);

        self.load_visual_info()?;
        let (num_orders, num_rows) = self.load_module_info()?;
        self.load_pattern_matrix(num_orders, num_rows)?;
        self.load_instruments()?;
        self.load_wavetables()?;
        self.load_patterns()?;
        self.load_pcm_samples()?;

        debug!("done importing DMF");
        Ok(())
    }

    fn load_visual_info(&mut self) -> Result<(), ModuleError> {
        let global = self.module.data.global_mut();
        global.title = self.reader.read_pstr().map_err(io_err)?;
        global.author = self.reader.read_pstr().map_err(io_err)?;
        global.highlight_a = self.reader.read_u8().map_err(io_err)?;
        global.highlight_b = self.reader.read_u8().map_err(io_err)?;
        info!("title: {:?} author: {:?}", global.title, global.author);
        Ok(())
    }

    fn load_module_info(&mut self) -> Result<(OrderIndex, RowIndex), ModuleError> {
        self.module.module_info.time_base = self.reader.read_u8().map_err(io_err)? + 1;
        self.module.module_info.tick_time1 = self.reader.read_u8().map_err(io_err)?;
        self.module.module_info.tick_time2 = self.reader.read_u8().map_err(io_err)?;

        let frames_mode = self.reader.read_u8().map_err(io_err)?;
        let using_custom_hz = self.reader.read_u8().map_err(io_err)? != 0;
        // The custom rate is stored as three ASCII digit characters
        let custom_hz_str = self.reader.read_str(3).map_err(io_err)?;

        let global = self.module.data.global_mut();
        global.frames_mode = frames_mode;
        if using_custom_hz {
            let digits: String = custom_hz_str
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if digits.is_empty() {
                // A blank custom rate box means NTSC
                global.global_tick = 60;
                global.custom_hz = Some(0);
            } else {
                let value: u16 = digits.parse().unwrap_or(60);
                global.global_tick = value;
                global.custom_hz = Some(value);
            }
        } else {
            // NTSC (60 Hz) or PAL (50 Hz)
            global.global_tick = if frames_mode != 0 { 60 } else { 50 };
            global.custom_hz = None;
        }

        let num_rows = if self.version() >= 24 {
            self.reader.read_u32().map_err(io_err)? as RowIndex
        } else {
            self.reader.read_u8().map_err(io_err)? as RowIndex
        };
        let num_orders = self.reader.read_u8().map_err(io_err)? as OrderIndex;

        // Arpeggio tick speed was stored here prior to version 20
        if self.version() <= 19 {
            self.reader.read_u8().map_err(io_err)?;
        }

        Ok((num_orders, num_rows))
    }

    fn load_pattern_matrix(
        &mut self,
        num_orders: OrderIndex,
        num_rows: RowIndex,
    ) -> Result<(), ModuleError> {
        let channels = self.system().channels;
        self.module
            .data
            .allocate_pattern_matrix(channels, num_orders, num_rows);

        let mut pattern_names: Vec<(u8, PatternIndex, String)> = Vec::new();
        for channel in 0..channels {
            for order in 0..num_orders {
                let pattern_id = self.reader.read_u8().map_err(io_err)? as PatternIndex;
                self.module.data.set_pattern_id(channel, order, pattern_id);

                // Pattern names were introduced in version 25
                if self.version() >= 25 {
                    let name = self.reader.read_pstr().map_err(io_err)?;
                    if !name.is_empty() {
                        pattern_names.push((channel, pattern_id, name));
                    }
                }
            }
        }

        self.module.data.allocate_channels();
        self.module.data.allocate_patterns();

        for (channel, pattern_id, name) in pattern_names {
            self.module
                .data
                .set_pattern_metadata(channel, pattern_id, DmfPatternMetadata { name });
        }
        Ok(())
    }

    fn read_envelope(&mut self, loop_pos_always: bool) -> Result<Envelope, ModuleError> {
        let size = self.reader.read_u8().map_err(io_err)?;
        let mut values = Vec::with_capacity(size as usize);
        for _ in 0..size {
            values.push(self.reader.read_i32().map_err(io_err)?);
        }
        let mut loop_pos = 0;
        if size > 0 || loop_pos_always {
            loop_pos = self.reader.read_i8().map_err(io_err)?;
        }
        Ok(Envelope { values, loop_pos })
    }

    fn load_instruments(&mut self) -> Result<(), ModuleError> {
        let total = self.reader.read_u8().map_err(io_err)?;
        for _ in 0..total {
            let instrument = self.load_instrument()?;
            self.module.instruments.push(instrument);
        }
        Ok(())
    }

    fn load_instrument(&mut self) -> Result<Instrument, ModuleError> {
        let name = self.reader.read_pstr().map_err(io_err)?;
        let mode = self.reader.read_u8().map_err(io_err)?;
        let kind = match mode {
            0 => InstrumentKind::Standard(self.load_std_instrument()?),
            1 => InstrumentKind::Fm(self.load_fm_instrument()?),
            _ => {
                return Err(ModuleError::import(
                    import_error::UNSPECIFIED,
                    "Invalid instrument mode",
                ))
            }
        };
        Ok(Instrument { name, kind })
    }

    fn load_std_instrument(&mut self) -> Result<StdInstrument, ModuleError> {
        let version = self.version();
        let system = self.system().kind;
        let mut inst = StdInstrument::default();

        // Version 17 and older always read the envelope loop position;
        // Game Boy modules have no volume envelope from version 18 on.
        let old_envelopes = version <= 17;
        if old_envelopes {
            inst.vol_env = self.read_envelope(true)?;
        } else if system != SystemType::GameBoy {
            inst.vol_env = self.read_envelope(false)?;
        }

        inst.arp_env = self.read_envelope(old_envelopes)?;
        inst.arp_macro_mode = self.reader.read_u8().map_err(io_err)?;
        inst.duty_noise_env = self.read_envelope(old_envelopes)?;
        inst.wavetable_env = self.read_envelope(old_envelopes)?;

        match system {
            SystemType::C64Sid8580 | SystemType::C64Sid6581 => {
                let mut c64 = C64InstrumentData::default();
                c64.tri_wave_en = self.reader.read_u8().map_err(io_err)?;
                c64.saw_wave_en = self.reader.read_u8().map_err(io_err)?;
                c64.pulse_wave_en = self.reader.read_u8().map_err(io_err)?;
                c64.noise_wave_en = self.reader.read_u8().map_err(io_err)?;
                c64.attack = self.reader.read_u8().map_err(io_err)?;
                c64.decay = self.reader.read_u8().map_err(io_err)?;
                c64.sustain = self.reader.read_u8().map_err(io_err)?;
                c64.release = self.reader.read_u8().map_err(io_err)?;
                c64.pulse_width = self.reader.read_u8().map_err(io_err)?;
                c64.ring_mod_en = self.reader.read_u8().map_err(io_err)?;
                c64.sync_mod_en = self.reader.read_u8().map_err(io_err)?;
                c64.to_filter = self.reader.read_u8().map_err(io_err)?;
                c64.vol_macro_to_filter_cutoff_en = self.reader.read_u8().map_err(io_err)?;
                c64.use_filter_values_from_inst = self.reader.read_u8().map_err(io_err)?;
                c64.filter_resonance = self.reader.read_u8().map_err(io_err)?;
                c64.filter_cutoff = self.reader.read_u8().map_err(io_err)?;
                c64.filter_high_pass = self.reader.read_u8().map_err(io_err)?;
                c64.filter_low_pass = self.reader.read_u8().map_err(io_err)?;
                c64.filter_ch2_off = self.reader.read_u8().map_err(io_err)?;
                inst.c64 = Some(c64);
            }
            SystemType::GameBoy if version >= 18 => {
                inst.game_boy = Some(GameBoyInstrumentData {
                    env_vol: self.reader.read_u8().map_err(io_err)?,
                    env_dir: self.reader.read_u8().map_err(io_err)?,
                    env_len: self.reader.read_u8().map_err(io_err)?,
                    sound_len: self.reader.read_u8().map_err(io_err)?,
                });
            }
            _ => {}
        }

        Ok(inst)
    }

    fn load_fm_instrument(&mut self) -> Result<FmInstrument, ModuleError> {
        let version = self.version();
        let system = self.system().kind;
        let opll = matches!(system, SystemType::SmsOpll | SystemType::NesVrc7);
        let mut inst = FmInstrument::default();

        if version > 18 {
            if opll {
                inst.alg = self.reader.read_u8().map_err(io_err)?; // SUS
                inst.fb = self.reader.read_u8().map_err(io_err)?;
                inst.lfo = self.reader.read_u8().map_err(io_err)?; // DC
                inst.lfo2 = self.reader.read_u8().map_err(io_err)?; // DM
            } else {
                inst.alg = self.reader.read_u8().map_err(io_err)?;
                inst.fb = self.reader.read_u8().map_err(io_err)?;
                inst.lfo = self.reader.read_u8().map_err(io_err)?;
                inst.lfo2 = self.reader.read_u8().map_err(io_err)?;
            }
            inst.num_operators = 4;
        } else {
            inst.alg = self.reader.read_u8().map_err(io_err)?;
            self.reader.read_u8().map_err(io_err)?; // reserved
            inst.fb = self.reader.read_u8().map_err(io_err)?;
            self.reader.read_u8().map_err(io_err)?; // reserved
            inst.lfo = self.reader.read_u8().map_err(io_err)?;
            self.reader.read_u8().map_err(io_err)?; // reserved
            let four_ops = self.reader.read_u8().map_err(io_err)? != 0;
            inst.num_operators = if four_ops { 4 } else { 2 };
            inst.lfo2 = self.reader.read_u8().map_err(io_err)?;
        }

        for i in 0..inst.num_operators as usize {
            let op = &mut inst.ops[i];
            if version > 18 {
                op.am = self.reader.read_u8().map_err(io_err)?;
                op.ar = self.reader.read_u8().map_err(io_err)?;
                op.dr = self.reader.read_u8().map_err(io_err)?;
                op.mult = self.reader.read_u8().map_err(io_err)?;
                op.rr = self.reader.read_u8().map_err(io_err)?;
                op.sl = self.reader.read_u8().map_err(io_err)?;
                op.tl = self.reader.read_u8().map_err(io_err)?;
                if opll {
                    let opll_preset = self.reader.read_u8().map_err(io_err)?;
                    if i == 0 {
                        inst.opll_preset = opll_preset;
                    }
                    op.ksr = self.reader.read_u8().map_err(io_err)?;
                    op.vib = self.reader.read_u8().map_err(io_err)?;
                    op.ksl = self.reader.read_u8().map_err(io_err)?;
                    op.ssg_mode = self.reader.read_u8().map_err(io_err)?; // EG-S
                } else {
                    op.dt2 = self.reader.read_u8().map_err(io_err)?;
                    op.rs = self.reader.read_u8().map_err(io_err)?;
                    op.dt = self.reader.read_u8().map_err(io_err)?;
                    op.d2r = self.reader.read_u8().map_err(io_err)?;
                    op.ssg_mode = self.reader.read_u8().map_err(io_err)?;
                }
            } else {
                op.am = self.reader.read_u8().map_err(io_err)?;
                op.ar = self.reader.read_u8().map_err(io_err)?;
                op.dam = self.reader.read_u8().map_err(io_err)?;
                op.dr = self.reader.read_u8().map_err(io_err)?;
                op.dvb = self.reader.read_u8().map_err(io_err)?;
                op.egt = self.reader.read_u8().map_err(io_err)?;
                op.ksl = self.reader.read_u8().map_err(io_err)?;
                op.mult = self.reader.read_u8().map_err(io_err)?;
                op.rr = self.reader.read_u8().map_err(io_err)?;
                op.sl = self.reader.read_u8().map_err(io_err)?;
                op.sus = self.reader.read_u8().map_err(io_err)?;
                op.tl = self.reader.read_u8().map_err(io_err)?;
                op.vib = self.reader.read_u8().map_err(io_err)?;
                op.ws = self.reader.read_u8().map_err(io_err)?;
                op.ksr = self.reader.read_u8().map_err(io_err)?; // RS on Genesis
                op.dt = self.reader.read_u8().map_err(io_err)?;
                op.d2r = self.reader.read_u8().map_err(io_err)?;
                op.ssg_mode = self.reader.read_u8().map_err(io_err)?;
            }
        }

        Ok(inst)
    }

    fn load_wavetables(&mut self) -> Result<(), ModuleError> {
        let total = self.reader.read_u8().map_err(io_err)?;
        let system = self.system().kind;
        let data_mask: u32 = match system {
            SystemType::GameBoy => 0xF,
            SystemType::NesFds => 0x3F,
            _ => 0xFFFF_FFFF,
        };

        for _ in 0..total {
            let size = self.reader.read_u32().map_err(io_err)?;
            let mut values = Vec::with_capacity(size as usize);
            for _ in 0..size {
                let mut value = self.reader.read_u32().map_err(io_err)? & data_mask;
                // Versions up to 25 stored FDS wavetables as 4-bit
                if system == SystemType::NesFds && self.version() <= 25 {
                    value <<= 2;
                }
                values.push(value);
            }
            self.module.wavetables.push(Wavetable { values });
        }
        debug!("loaded {total} wavetable(s)");
        Ok(())
    }

    fn load_patterns(&mut self) -> Result<(), ModuleError> {
        let channels = self.module.data.num_channels();
        let num_orders = self.module.data.num_orders();
        let num_rows = self.module.data.num_rows();

        for channel in 0..channels {
            let effect_columns = self.reader.read_u8().map_err(io_err)?;
            self.module
                .data
                .set_channel_metadata(channel, DmfChannelMetadata { effect_columns });

            let mut visited = vec![false; self.module.data.num_patterns(channel) as usize];
            for order in 0..num_orders {
                let pattern_id = self.module.data.pattern_id(channel, order);

                if visited[pattern_id as usize] {
                    // Already loaded through an earlier order. The inflate
                    // stream cannot seek, so discard the fixed-size block.
                    let block = (8 + 4 * effect_columns as usize) * num_rows as usize;
                    self.reader.skip(block).map_err(io_err)?;
                    continue;
                }
                visited[pattern_id as usize] = true;

                for row in 0..num_rows {
                    let value = self.load_pattern_row(effect_columns)?;
                    self.module.data.set_row_by_id(channel, pattern_id, row, value);
                }
            }
        }
        Ok(())
    }

    fn load_pattern_row(&mut self, effect_columns: u8) -> Result<DmfRow, ModuleError> {
        let mut row = DmfRow::default();

        let pitch = self.reader.read_u16().map_err(io_err)?;
        let octave = self.reader.read_u16().map_err(io_err)? as u8; // upper byte unused

        row.note = match pitch {
            0 if octave == 0 => NoteSlot::Empty,
            0 => NoteSlot::Note(Note::new(NotePitch::C, octave)),
            100 => NoteSlot::Off,
            // The pitch for a C can be stored as either 0 or 12
            12 => NoteSlot::Note(Note::new(NotePitch::C, octave + 1)),
            _ => {
                let pitch = NotePitch::from_index(pitch as u8).ok_or_else(|| {
                    ModuleError::import(
                        import_error::UNSPECIFIED,
                        format!("Invalid note pitch: {pitch}"),
                    )
                })?;
                NoteSlot::Note(Note::new(pitch, octave))
            }
        };

        row.volume = self.reader.read_i16().map_err(io_err)?;

        for col in 0..effect_columns as usize {
            let code = self.reader.read_i16().map_err(io_err)?;
            let value = self.reader.read_i16().map_err(io_err)?;
            row.effects[col] = Effect::new(translate_effect_code(code), value);
        }

        row.instrument = self.reader.read_i16().map_err(io_err)?;
        Ok(row)
    }

    fn load_pcm_samples(&mut self) -> Result<(), ModuleError> {
        let total = self.reader.read_u8().map_err(io_err)?;
        for _ in 0..total {
            let sample = self.load_pcm_sample()?;
            self.module.pcm_samples.push(sample);
        }
        Ok(())
    }

    fn load_pcm_sample(&mut self) -> Result<PcmSample, ModuleError> {
        let version = self.version();
        let mut sample = PcmSample::default();

        let size = self.reader.read_u32().map_err(io_err)?;

        // PCM samples are unnamed before version 24
        if version >= 24 {
            sample.name = self.reader.read_pstr().map_err(io_err)?;
        }

        sample.rate = self.reader.read_u8().map_err(io_err)?;
        sample.pitch = self.reader.read_u8().map_err(io_err)?;
        sample.amp = self.reader.read_u8().map_err(io_err)?;
        if version >= 22 {
            sample.bits = self.reader.read_u8().map_err(io_err)?;
        }

        if version >= 27 {
            sample.cut_start = self.reader.read_u32().map_err(io_err)?;
            sample.cut_end = self.reader.read_u32().map_err(io_err)?;
            if sample.cut_start > size {
                return Err(ModuleError::import(
                    import_error::UNSPECIFIED,
                    "Sample cut start is out of range",
                ));
            }
            if sample.cut_end > size {
                return Err(ModuleError::import(
                    import_error::UNSPECIFIED,
                    "Sample cut end is out of range",
                ));
            }
            if sample.cut_end < sample.cut_start {
                return Err(ModuleError::import(
                    import_error::UNSPECIFIED,
                    "Sample cut end is before sample cut start",
                ));
            }
        } else {
            sample.cut_start = 0;
            sample.cut_end = size;
        }

        sample.data = Vec::with_capacity(size as usize);
        for _ in 0..size {
            sample.data.push(self.reader.read_u16().map_err(io_err)?);
        }

        Ok(sample)
    }
}

/// Translate a raw DMF effect code into the internal code space.
fn translate_effect_code(code: i16) -> remod_ir::EffectCode {
    match code {
        -1 => effects::NONE,
        0x0 => effects::ARP,
        0x1 => effects::PORT_UP,
        0x2 => effects::PORT_DOWN,
        0x3 => effects::PORT2NOTE,
        0x4 => effects::VIBRATO,
        0x5 => effects::PORT2NOTE_VOL_SLIDE,
        0x6 => effects::VIBRATO_VOL_SLIDE,
        0x7 => effects::TREMOLO,
        0x8 => effects::PANNING,
        0x9 => effects::SPEED_A,
        0xA => effects::VOL_SLIDE,
        0xB => effects::POS_JUMP,
        0xC => effects::RETRIGGER,
        0xD => effects::PAT_BREAK,
        0xE0 => dmf_effects::ARP_TICK_SPEED,
        0xE1 => dmf_effects::NOTE_SLIDE_UP,
        0xE2 => dmf_effects::NOTE_SLIDE_DOWN,
        0xE3 => dmf_effects::SET_VIBRATO_MODE,
        0xE4 => dmf_effects::SET_FINE_VIBRATO_DEPTH,
        0xE5 => dmf_effects::SET_FINETUNE,
        0xEB => dmf_effects::SET_SAMPLES_BANK,
        0xEC => effects::NOTE_CUT,
        0xED => effects::NOTE_DELAY,
        0xEE => dmf_effects::SYNC_SIGNAL,
        0xEF => dmf_effects::SET_GLOBAL_FINETUNE,
        0xF => effects::SPEED_B,
        0x10 => dmf_effects::GAME_BOY_SET_WAVE,
        0x11 => dmf_effects::GAME_BOY_SET_NOISE_POLY_COUNTER_MODE,
        0x12 => dmf_effects::GAME_BOY_SET_DUTY_CYCLE,
        0x13 => dmf_effects::GAME_BOY_SET_SWEEP_TIME_SHIFT,
        0x14 => dmf_effects::GAME_BOY_SET_SWEEP_DIR,
        _ => effects::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn effect_code_translation() {
        assert_eq!(translate_effect_code(-1), effects::NONE);
        assert_eq!(translate_effect_code(0x0), effects::ARP);
        assert_eq!(translate_effect_code(0xB), effects::POS_JUMP);
        assert_eq!(translate_effect_code(0xD), effects::PAT_BREAK);
        assert_eq!(translate_effect_code(0xEC), effects::NOTE_CUT);
        assert_eq!(translate_effect_code(0x12), dmf_effects::GAME_BOY_SET_DUTY_CYCLE);
        assert_eq!(translate_effect_code(0x10), dmf_effects::GAME_BOY_SET_WAVE);
        assert_eq!(translate_effect_code(0x1234), effects::NONE);
    }

    #[test]
    fn system_lookup_by_id() {
        assert_eq!(system_by_id(0x04).unwrap().kind, SystemType::GameBoy);
        assert_eq!(system_by_id(0x04).unwrap().channels, 4);
        assert_eq!(system_by_id(0x86).unwrap().kind, SystemType::NesFds);
        assert_eq!(system_by_id(0xFF), None);
    }

    #[test]
    fn sound_index_orders_silence_first() {
        // Sample-id assignment relies on this ordering
        assert!(DmfSoundIndex::None < DmfSoundIndex::Square(0));
        assert!(DmfSoundIndex::Square(3) < DmfSoundIndex::Wave(0));
        assert!(DmfSoundIndex::Wave(0) < DmfSoundIndex::Wave(1));
    }

    #[test]
    fn default_row_is_inert() {
        let row = DmfRow::default();
        assert!(row.note.is_empty());
        assert_eq!(row.volume, NO_VOLUME);
        assert_eq!(row.instrument, NO_INSTRUMENT);
        assert!(row.effects.iter().all(|e| e.code == effects::NONE));
    }
}
