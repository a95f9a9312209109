//! Module formats for the remod converter.
//!
//! Imports Deflemask DMF files into the IR and exports ProTracker MOD
//! files from it. The [`Module`] enum is the front ends' entry point:
//! create a module of a [`ModuleKind`], feed it bytes, convert, export.

mod dmf_format;
mod dmf_generate;
mod mod_format;
pub mod reader;
pub mod sample_mapper;
pub mod tempo;

pub use dmf_format::{
    dmf_effects, game_boy_channel, system_by_id, C64InstrumentData, DmfChannelMetadata, DmfFormat,
    DmfGlobalData, DmfModule, DmfModuleInfo, DmfPatternMetadata, DmfRow, DmfSoundIndex, Envelope,
    FmInstrument, FmOperator, GameBoyInstrumentData, Instrument, InstrumentKind, PcmSample,
    StdInstrument, System, SystemType, Wavetable, FILE_VERSION_MAX, FILE_VERSION_MIN,
    GAME_BOY_VOLUME_MAX, NO_INSTRUMENT, NO_VOLUME,
};
pub use mod_format::{
    default_options as default_mod_options, mod_convert_error, option_definitions, pack_row,
    pt_effect, unpack_row, ConvertWarning, EffectPriority, ModFormat, ModGlobalData, ModModule,
    ModOptions, ModRow, ModSample, TempoMode, PERIOD_TABLE, VOLUME_MAX,
};

use remod_ir::{convert_error, Category, ConversionOptions, ModuleError, Status};

/// The module formats remod knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Dmf,
    Mod,
}

impl ModuleKind {
    /// The conventional file extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            ModuleKind::Dmf => "dmf",
            ModuleKind::Mod => "mod",
        }
    }

    /// Pick a format from a file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "dmf" => Some(ModuleKind::Dmf),
            "mod" => Some(ModuleKind::Mod),
            _ => None,
        }
    }
}

/// The conversion options a format recognizes, at their defaults.
/// DMF input has none.
pub fn new_options(kind: ModuleKind) -> ConversionOptions {
    match kind {
        ModuleKind::Dmf => ConversionOptions::default(),
        ModuleKind::Mod => mod_format::default_options(),
    }
}

/// A module of either format.
#[derive(Debug)]
pub enum Module {
    Dmf(DmfModule),
    Mod(ModModule),
}

/// An empty module of the given kind.
pub fn new_module(kind: ModuleKind) -> Module {
    match kind {
        ModuleKind::Dmf => Module::Dmf(DmfModule::new()),
        ModuleKind::Mod => Module::Mod(ModModule::new()),
    }
}

impl Module {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Dmf(_) => ModuleKind::Dmf,
            Module::Mod(_) => ModuleKind::Mod,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Module::Dmf(module) => module.title(),
            Module::Mod(module) => module.title(),
        }
    }

    /// Error and warnings from the last operation on this module.
    pub fn status(&self) -> &Status {
        match self {
            Module::Dmf(module) => &module.status,
            Module::Mod(module) => &module.status,
        }
    }

    fn status_mut(&mut self) -> &mut Status {
        match self {
            Module::Dmf(module) => &mut module.status,
            Module::Mod(module) => &mut module.status,
        }
    }

    /// Parse a byte stream into this module.
    pub fn import(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
        let result = match self {
            Module::Dmf(module) => {
                let mut fresh = DmfModule::new();
                let result = fresh.import(bytes);
                if result.is_ok() {
                    *module = fresh;
                }
                result
            }
            Module::Mod(_) => Err(ModuleError::import(
                convert_error::UNSUCCESSFUL,
                "MOD import is not implemented.",
            )),
        };
        let status = self.status_mut();
        status.reset(Category::Import);
        if let Err(ref error) = result {
            status.add_error(error.clone());
        }
        result
    }

    /// Convert this module to the target format. Converting a module to
    /// its own format is an error. Warnings land on the returned
    /// module's status; a failure is also recorded on this module.
    pub fn convert(
        &mut self,
        target: ModuleKind,
        options: &ConversionOptions,
    ) -> Result<Module, ModuleError> {
        if target == self.kind() {
            let error = ModuleError::convert(
                convert_error::INVALID_ARGUMENT,
                "Cannot convert a module to its own format.",
            );
            self.status_mut().reset(Category::Convert);
            self.status_mut().add_error(error.clone());
            return Err(error);
        }

        let result = match (&mut *self, target) {
            (Module::Dmf(dmf), ModuleKind::Mod) => {
                ModModule::from_dmf(dmf, options).map(Module::Mod)
            }
            (Module::Mod(_), ModuleKind::Dmf) => Err(ModuleError::convert(
                convert_error::UNSUPPORTED_INPUT_TYPE,
                "Converting MOD back to DMF is not supported.",
            )),
            _ => Err(ModuleError::convert(
                convert_error::UNSUPPORTED_INPUT_TYPE,
                "Unsupported conversion.",
            )),
        };

        if let Err(ref error) = result {
            let status = self.status_mut();
            status.reset(Category::Convert);
            status.add_error(error.clone());
        }
        result
    }

    /// Serialize this module to its on-disk byte layout.
    pub fn export(&mut self) -> Result<Vec<u8>, ModuleError> {
        let result = match &*self {
            Module::Mod(module) => module.to_bytes(),
            Module::Dmf(_) => Err(ModuleError::export(
                convert_error::UNSUCCESSFUL,
                "DMF export is not implemented.",
            )),
        };
        if let Err(ref error) = result {
            let status = self.status_mut();
            status.reset(Category::Export);
            status.add_error(error.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_extension() {
        assert_eq!(ModuleKind::from_extension("dmf"), Some(ModuleKind::Dmf));
        assert_eq!(ModuleKind::from_extension("MOD"), Some(ModuleKind::Mod));
        assert_eq!(ModuleKind::from_extension("xm"), None);
        assert_eq!(ModuleKind::Mod.extension(), "mod");
    }

    #[test]
    fn converting_to_own_format_is_an_error() {
        let mut module = new_module(ModuleKind::Dmf);
        let options = new_options(ModuleKind::Dmf);
        let error = module.convert(ModuleKind::Dmf, &options).unwrap_err();
        assert_eq!(error.code, convert_error::INVALID_ARGUMENT);
        assert!(module.status().error_occurred());
    }

    #[test]
    fn mod_options_carry_defaults() {
        let options = new_options(ModuleKind::Mod);
        assert_eq!(options.get_bool("downsample"), Some(false));
        assert_eq!(options.get_str("tempo"), Some("accuracy"));
        // DMF files have no conversion options
        assert!(new_options(ModuleKind::Dmf).get("downsample").is_none());
    }

    #[test]
    fn failed_import_is_recorded_on_status() {
        let mut module = new_module(ModuleKind::Dmf);
        assert!(module.import(b"not a dmf").is_err());
        assert!(module.status().error_occurred());
        assert_eq!(module.status().category(), Category::Import);
    }
}
