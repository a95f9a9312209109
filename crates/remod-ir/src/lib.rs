//! Core IR types for the remod module converter.
//!
//! This crate defines the format-agnostic representation shared by the
//! importers and exporters: notes and effects, the module data container,
//! the per-order/per-row state timeline, generated (derived) data, and the
//! conversion options and status types.
//!
//! Format crates fill these structures during import and walk them during
//! export; nothing here knows about any on-disk layout.

pub mod effects;
mod generated;
mod module_data;
mod note;
mod options;
mod state;
mod status;

pub use effects::{Effect, EffectCode, EffectValue, EFFECT_VALUELESS};
pub use generated::{DataFlags, GeneratedData, GENERATE_LOOPBACK_ORDER_NEEDED};
pub use module_data::{
    ChannelIndex, CorData, ModuleFormat, OrcData, OrderIndex, PatternIndex, RowIndex,
};
pub use note::{note_range, Note, NotePitch, NoteSlot};
pub use options::{ConversionOptions, OptionDefinition, OptionValue};
pub use state::{
    channel, global, position, split_position, ChannelState, DeltaSet, GlobalState, ModuleState,
    OneShot, OneShotVec, Portamento, PortamentoKind, Position, StateReader, StateReaders,
    StateVec, StateWriter, Sticky, TimelineState,
};
pub use status::{convert_error, export_error, Category, ModuleError, Status};
