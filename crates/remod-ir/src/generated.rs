//! Derived (generated) module data: facts computed from module data that
//! exporters need but importers do not provide directly.

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;

use crate::module_data::{ChannelIndex, OrderIndex};
use crate::note::Note;
use crate::state::ModuleState;

bitflags! {
    /// Requests that alter how the state generator interprets module data.
    pub struct DataFlags: u32 {
        /// Generate MOD-compatible portamentos (disables the port-to-note
        /// auto-off, which ProTracker needs an extra row for).
        const MOD_PORTAMENTOS = 0b01;
        /// Generate MOD-compatible loops: insert a note off at loopback
        /// points when a note would otherwise carry over.
        const MOD_LOOPS = 0b10;
    }
}

impl Default for DataFlags {
    fn default() -> Self {
        DataFlags::empty()
    }
}

/// Generator status bit: a loopback could not be made MOD-accurate and an
/// extra loopback order would be needed. A warning, not an error.
pub const GENERATE_LOOPBACK_ORDER_NEEDED: usize = 0b10;

/// Cache of derived facts about a module, keyed by the [`DataFlags`] it
/// was generated with. `I` is the format's sound-index type.
///
/// Created empty; filled by the format's generator in one pass; consulted
/// by exporters. Regenerated only when the flags differ from the cached
/// generation.
#[derive(Debug)]
pub struct GeneratedData<I> {
    /// May be less than the module's order count when position jumps skip
    /// orders.
    pub total_orders: Option<OrderIndex>,
    pub note_off_used: Option<bool>,
    pub channel_note_extremes: Option<BTreeMap<ChannelIndex, (Note, Note)>>,
    pub sound_index_note_extremes: Option<BTreeMap<I, (Note, Note)>>,
    pub sound_indexes_used: Option<BTreeSet<I>>,
    pub state: Option<ModuleState<I>>,
    generated: Option<DataFlags>,
    status: usize,
}

impl<I> Default for GeneratedData<I> {
    fn default() -> Self {
        Self {
            total_orders: None,
            note_off_used: None,
            channel_note_extremes: None,
            sound_index_note_extremes: None,
            sound_indexes_used: None,
            state: None,
            generated: None,
            status: 0,
        }
    }
}

impl<I> GeneratedData<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is there valid generated data?
    pub fn is_valid(&self) -> bool {
        self.generated.is_some()
    }

    /// The flags the data was generated with, if valid.
    pub fn generated_flags(&self) -> Option<DataFlags> {
        self.generated
    }

    pub fn set_generated(&mut self, flags: DataFlags) {
        self.generated = Some(flags);
    }

    /// Status word returned by the generator. Only meaningful while
    /// [`GeneratedData::is_valid`] holds.
    pub fn status(&self) -> usize {
        self.status
    }

    pub fn set_status(&mut self, status: usize) {
        self.status = status;
    }

    /// Destroy all generated data. Call after any change that would make
    /// it stale.
    pub fn clear_all(&mut self) {
        *self = Self::default();
    }
}
