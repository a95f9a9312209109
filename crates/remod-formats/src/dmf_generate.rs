//! State generation for DMF modules.
//!
//! One left-to-right sweep per channel interprets row effects into the
//! state timeline and computes the loop/jump skeleton of the song. Only
//! the Game Boy system is supported.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use remod_ir::{
    channel, convert_error, effects, global, ChannelIndex, DataFlags, ModuleError, ModuleState,
    Note, NotePitch, NoteSlot, OrderIndex, Portamento, PortamentoKind, Position, RowIndex,
    StateWriter, EFFECT_VALUELESS, GENERATE_LOOPBACK_ORDER_NEEDED,
};
use remod_ir::position;

use crate::dmf_format::{
    dmf_effects, game_boy_channel, DmfModule, DmfSoundIndex, SystemType, GAME_BOY_VOLUME_MAX,
    NO_VOLUME,
};

/// Reference period for a note. Precomputed for all 12 * 9 notes the DMF
/// note range covers.
pub(crate) fn note_period(note: Note) -> f64 {
    static TABLE: OnceLock<[f64; 12 * 9]> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = [0.0; 12 * 9];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = 262144.0 / (27.5 * 2.0_f64.powf((i as f64 + 3.0) / 12.0));
        }
        table
    });
    table[note.semitone_index() as usize]
}

/// Advance a channel's note period by one row of portamento.
fn update_period(
    period: f64,
    dmf_row: RowIndex,
    port: Portamento,
    target_period: f64,
    ticks: [f64; 2],
    lowest_period: f64,
    highest_period: f64,
) -> f64 {
    let tick = ticks[(dmf_row % 2) as usize];
    match port.kind {
        PortamentoKind::Up => (period - port.value as f64 * tick * 4.0 / 3.0).max(highest_period),
        PortamentoKind::Down => (period + port.value as f64 * tick).min(lowest_period),
        PortamentoKind::ToNote => {
            debug_assert!(target_period >= highest_period && target_period <= lowest_period);
            if target_period < period {
                // Target is a higher pitch
                let amount = port.value as f64 * tick * 4.0 / 3.0;
                if (target_period - period).abs() < amount {
                    target_period
                } else {
                    period - amount
                }
            } else {
                let amount = port.value as f64 * tick;
                if (target_period - period).abs() < amount {
                    target_period
                } else {
                    period + amount
                }
            }
        }
        PortamentoKind::None => period,
    }
}

fn update_extremes<K: Ord>(map: &mut BTreeMap<K, (Note, Note)>, key: K, note: Note) {
    map.entry(key)
        .and_modify(|pair| {
            if note > pair.1 {
                pair.1 = note;
            }
            if note < pair.0 {
                pair.0 = note;
            }
        })
        .or_insert((note, note));
}

impl DmfModule {
    /// Derive the playback state timeline and related facts, caching the
    /// result per flag set. Returns the generator status word.
    ///
    /// Deflemask portamento effects turn themselves off in several
    /// situations the manual does not mention: when a new note arrives,
    /// when a port-to-note reaches its target, and when the period hits
    /// the C-2/C-8 clamps. The period model below reproduces that, which
    /// is what lets the exporter know when a portamento effect must stop
    /// being emitted.
    pub fn generate_data(&mut self, flags: DataFlags) -> Result<usize, ModuleError> {
        if self.generated.generated_flags() == Some(flags) {
            return Ok(self.generated.status());
        }
        self.generated.clear_all();

        if self.system().kind != SystemType::GameBoy {
            return Err(ModuleError::convert(
                convert_error::UNSUCCESSFUL,
                "Only the Game Boy system is currently supported.",
            ));
        }

        let data = &self.data;
        let num_channels = data.num_channels();
        let num_orders = data.num_orders();
        let num_rows = data.num_rows();
        if num_orders == 0 || num_rows == 0 {
            return Err(ModuleError::convert(
                convert_error::UNSUCCESSFUL,
                "Module has no pattern data.",
            ));
        }

        let no_port2note_auto_off = flags.contains(DataFlags::MOD_PORTAMENTOS);
        let mod_compat_loops = flags.contains(DataFlags::MOD_LOOPS);
        let mut status: usize = 0;

        let mut state = ModuleState::<DmfSoundIndex>::new(num_channels as usize);
        let mut sound_indexes_used: BTreeSet<DmfSoundIndex> = BTreeSet::new();
        let mut sound_index_note_extremes: BTreeMap<DmfSoundIndex, (Note, Note)> = BTreeMap::new();
        let mut channel_note_extremes: BTreeMap<ChannelIndex, (Note, Note)> = BTreeMap::new();
        let mut note_off_used = false;

        let time_base = self.module_info.time_base as u32;
        let ticks = [
            (time_base * self.module_info.tick_time1 as u32) as f64,
            (time_base * self.module_info.tick_time2 as u32) as f64,
        ]; // even, odd rows

        let lowest_period = note_period(Note::new(NotePitch::C, 2));
        let highest_period = note_period(Note::new(NotePitch::C, 8));

        // Note period per channel, driven by portamentos. 0 means off.
        let mut periods = vec![0.0f64; num_channels as usize];
        // Target period of an active port-to-note
        let mut target_periods = vec![lowest_period; num_channels as usize];
        // Notes can be cancelled by port-to-note effects; see below
        let mut note_cancelled = vec![false; num_channels as usize];

        // Loopback points (from, to); written into the state afterwards
        let mut loopbacks: Vec<(Position, Position)> = Vec::new();

        // PosJump/PatBreak bookkeeping, all indexed by DMF order
        let mut order_map = vec![OrderIndex::MAX; num_orders as usize];
        order_map[0] = 0;
        let mut skipped_orders = vec![false; num_orders as usize];
        let mut starting_row = vec![0 as RowIndex; num_orders as usize];
        let mut last_row = vec![num_rows; num_orders as usize];
        let mut total_gen_orders: OrderIndex = 0;
        let mut num_orders_skipped: OrderIndex = 0;

        // Sound index currently selected in each channel, with the
        // position where it was selected
        let mut current_sound_index: Vec<(Position, DmfSoundIndex)> = (0..num_channels)
            .map(|ch| match ch {
                game_boy_channel::WAVE => (-1, DmfSoundIndex::Wave(0)),
                game_boy_channel::NOISE => (-1, DmfSoundIndex::Noise(0)),
                _ => (-1, DmfSoundIndex::Square(0)),
            })
            .collect();

        {
            let mut gw = StateWriter::new(&mut state.global);
            gw.set_initial::<global::SpeedA>(self.module_info.tick_time1);
            gw.set_initial::<global::SpeedB>(self.module_info.tick_time2);
            gw.set_initial::<global::Tempo>(0);
        }
        for (i, channel_state) in state.channels.iter_mut().enumerate() {
            let mut w = StateWriter::new(channel_state);
            w.set_initial::<channel::SoundIndex>(current_sound_index[i].1);
            w.set_initial::<channel::NoteCell>(NoteSlot::Empty);
            w.set_initial::<channel::NotePlaying>(false);
            w.set_initial::<channel::Volume>(GAME_BOY_VOLUME_MAX);
            w.set_initial::<channel::Arp>(0);
            w.set_initial::<channel::Port>(Portamento::default());
            w.set_initial::<channel::Vibrato>(0);
            w.set_initial::<channel::Port2NoteVolSlide>(0);
            w.set_initial::<channel::VibratoVolSlide>(0);
            w.set_initial::<channel::Tremolo>(0);
            w.set_initial::<channel::Panning>(127);
            w.set_initial::<channel::VolSlide>(0);
        }

        let ModuleState { global: global_state, channels: channel_states } = &mut state;

        for ch in 0..num_channels {
            if ch == game_boy_channel::NOISE {
                continue;
            }
            let mut cw = StateWriter::new(&mut channel_states[ch as usize]);
            let mut gw = StateWriter::new(&mut *global_state);
            let chu = ch as usize;

            for order in 0..num_orders {
                if skipped_orders[order as usize] {
                    continue;
                }
                let gen_order = order_map[order as usize];
                debug_assert!(gen_order != OrderIndex::MAX);
                let row_offset = starting_row[order as usize];

                let mut row = row_offset;
                'rows: while row < last_row[order as usize] {
                    let gen_row = row - row_offset;
                    let pos = position(gen_order, gen_row);
                    cw.set_write_pos(pos);
                    let row_data = *data.row(ch, order, row);

                    // Port-to-note stops when the next note arrives or on
                    // a note off
                    if !row_data.note.is_empty()
                        && cw.latest::<channel::Port>().kind == PortamentoKind::ToNote
                    {
                        cw.set::<channel::Port>(Portamento::default());
                    }

                    // Port-to-note also stops once it reaches its target.
                    // Skipped for MOD-compatible portamentos: ProTracker
                    // needs the effect on for one extra row to get there.
                    if !no_port2note_auto_off
                        && periods[chu] == target_periods[chu]
                        && cw.latest::<channel::Port>().kind == PortamentoKind::ToNote
                    {
                        cw.set::<channel::Port>(Portamento::default());
                    }

                    // Any portamento stops when the period is pinned at
                    // either end of the playable range
                    if (periods[chu] >= lowest_period || periods[chu] <= highest_period)
                        && cw.latest::<channel::Port>().kind != PortamentoKind::None
                    {
                        cw.set::<channel::Port>(Portamento::default());
                    }

                    // Scan the effect columns. Right to left: the
                    // left-most effect of a kind wins.
                    let mut port_up: Option<u8> = None;
                    let mut port_down: Option<u8> = None;
                    let mut port2note: Option<u8> = None;
                    let mut prev_port_cancelled = false;

                    // When no pitched note has played in the channel yet,
                    // a port-to-note with a value > 0 cancels the new note
                    // and every later note until some port effect, note
                    // off, or auto-off ends it.
                    let cancellation_possible =
                        cw.len_of::<channel::NoteCell>() == 1 && row_data.note.has_pitch();
                    let mut just_cancelled = false;
                    let mut temp_note_cancelled = note_cancelled[chu];

                    let mut arp: Option<u8> = None;
                    let mut vibrato: Option<u8> = None;
                    let mut port2note_vol_slide: Option<u8> = None;
                    let mut vibrato_vol_slide: Option<u8> = None;
                    let mut tremolo: Option<u8> = None;
                    let mut panning: Option<u8> = None;
                    let mut vol_slide: Option<u8> = None;
                    let mut retrigger: Option<u8> = None;
                    let mut note_cut: Option<u8> = None;
                    let mut note_delay: Option<u8> = None;
                    let mut sound_index = DmfSoundIndex::None;

                    for effect in row_data.effects.iter().rev() {
                        if effect.code == effects::NONE {
                            continue;
                        }
                        let value = effect.value;
                        // Valueless and zero behave identically here
                        let value_normal = if value != EFFECT_VALUELESS { value as u8 } else { 0 };

                        match effect.code {
                            effects::ARP => arp = Some(value_normal),
                            effects::PORT_UP => {
                                prev_port_cancelled = true;
                                temp_note_cancelled = false;
                                port_up = Some(value_normal);
                            }
                            effects::PORT_DOWN => {
                                prev_port_cancelled = true;
                                temp_note_cancelled = false;
                                port_down = Some(value_normal);
                            }
                            effects::PORT2NOTE => {
                                prev_port_cancelled = true;
                                if cancellation_possible {
                                    note_cancelled[chu] = value > 0;
                                    just_cancelled = value > 0;
                                }
                                port2note = Some(value_normal);
                            }
                            effects::VIBRATO => vibrato = Some(value_normal),
                            effects::PORT2NOTE_VOL_SLIDE => {
                                port2note_vol_slide = Some(value_normal)
                            }
                            effects::VIBRATO_VOL_SLIDE => vibrato_vol_slide = Some(value_normal),
                            effects::TREMOLO => tremolo = Some(value_normal),
                            effects::PANNING => panning = Some(value_normal),
                            effects::VOL_SLIDE => vol_slide = Some(value_normal),
                            effects::RETRIGGER => retrigger = Some(value_normal),
                            effects::NOTE_CUT => note_cut = Some(value_normal),
                            effects::NOTE_DELAY => note_delay = Some(value_normal),
                            // SpeedA/SpeedB/Tempo/PosJump/PatBreak are
                            // handled by the global pass below
                            dmf_effects::GAME_BOY_SET_WAVE => {
                                if ch != game_boy_channel::WAVE || value < 0 {
                                    continue;
                                }
                                if value as usize >= self.wavetables.len() {
                                    // An out-of-range SetWave misbehaves in
                                    // Deflemask; ignore it
                                    continue;
                                }
                                sound_index = DmfSoundIndex::Wave(value_normal);
                            }
                            dmf_effects::GAME_BOY_SET_DUTY_CYCLE => {
                                if ch > game_boy_channel::SQUARE_2 || value < 0 || value >= 4 {
                                    continue;
                                }
                                sound_index = DmfSoundIndex::Square(value_normal);
                            }
                            _ => {}
                        }
                    }

                    let mut port2note_used = false;
                    if !just_cancelled && !temp_note_cancelled {
                        // A port up/down/to-note "uncancels" the notes
                        note_cancelled[chu] = false;

                        // Highest priority first
                        let new_port = if let Some(v) = port2note {
                            port2note_used = true;
                            Some(Portamento { kind: PortamentoKind::ToNote, value: v })
                        } else if let Some(v) = port_down {
                            Some(Portamento { kind: PortamentoKind::Down, value: v })
                        } else if let Some(v) = port_up {
                            Some(Portamento { kind: PortamentoKind::Up, value: v })
                        } else if prev_port_cancelled {
                            Some(Portamento::default())
                        } else {
                            None
                        };

                        if let Some(port) = new_port {
                            if port.value != 0 {
                                cw.set::<channel::Port>(port);
                            } else {
                                cw.set::<channel::Port>(Portamento::default());
                            }
                        }
                    }

                    if let Some(v) = arp {
                        cw.set::<channel::Arp>(v);
                    }
                    if let Some(v) = vibrato {
                        cw.set::<channel::Vibrato>(v);
                    }
                    if let Some(v) = port2note_vol_slide {
                        cw.set::<channel::Port2NoteVolSlide>(v);
                    }
                    if let Some(v) = vibrato_vol_slide {
                        cw.set::<channel::VibratoVolSlide>(v);
                    }
                    if let Some(v) = tremolo {
                        cw.set::<channel::Tremolo>(v);
                    }
                    if let Some(v) = panning {
                        cw.set::<channel::Panning>(v);
                    }
                    if let Some(v) = vol_slide {
                        cw.set::<channel::VolSlide>(v);
                    }
                    if let Some(v) = retrigger {
                        cw.set_one_shot::<channel::Retrigger>(v);
                    }
                    if let Some(v) = note_cut {
                        cw.set_one_shot::<channel::NoteCut>(v);
                    }
                    if let Some(v) = note_delay {
                        cw.set_one_shot::<channel::NoteDelay>(v);
                    }
                    if sound_index != DmfSoundIndex::None {
                        current_sound_index[chu] = (pos, sound_index);
                    }

                    // Notes. Empty slots between notes are not stored.
                    let note_slot = row_data.note;
                    if note_slot.is_off() {
                        cw.set::<channel::NoteCell>(note_slot);
                        cw.set::<channel::NotePlaying>(false);
                        note_off_used = true;
                        // An off also uncancels port-to-note cancellation;
                        // the period is left alone
                        note_cancelled[chu] = false;
                    } else if let Some(note) = note_slot.note() {
                        if !note_cancelled[chu] {
                            cw.set_always::<channel::NoteCell>(note_slot);
                            cw.set::<channel::NotePlaying>(true);

                            if !port2note_used {
                                periods[chu] = note_period(note);
                            } else {
                                target_periods[chu] = note_period(note);
                            }

                            let (si_pos, si) = current_sound_index[chu];
                            sound_indexes_used.insert(si);

                            // Commit the sound index back at the position
                            // its effect appeared. Still appends at the
                            // end of the vector, so ordering holds.
                            cw.set_write_pos(si_pos);
                            cw.set::<channel::SoundIndex>(si);
                            cw.set_write_pos(pos);

                            update_extremes(&mut sound_index_note_extremes, si, note);
                            update_extremes(&mut channel_note_extremes, ch, note);
                        }
                    }

                    let port = *cw.latest::<channel::Port>();
                    periods[chu] = update_period(
                        periods[chu],
                        row,
                        port,
                        target_periods[chu],
                        ticks,
                        lowest_period,
                        highest_period,
                    );

                    // Volume. The wave channel's four hardware levels make
                    // it quantized; the square channels need an attached
                    // note for a volume column to register.
                    if row_data.volume != NO_VOLUME {
                        if ch == game_boy_channel::WAVE {
                            let quantized = match row_data.volume {
                                0..=3 => 0,
                                4..=7 => 5,
                                8..=11 => 10,
                                _ => 15,
                            };
                            cw.set::<channel::Volume>(quantized);
                        } else if row_data.note.has_pitch() {
                            cw.set::<channel::Volume>(row_data.volume as u8);
                        }
                    }

                    // Global state: computed once per row, on the first
                    // channel's sweep, by inspecting every channel.
                    if ch == 0 {
                        gw.set_write_pos(pos);

                        // The left-most PosJump or PatBreak in the row
                        // wins; an invalid left-most one disables all
                        // later effects of its kind, and a valid PatBreak
                        // beats any PosJump.
                        let mut pos_jump: Option<OrderIndex> = None;
                        let mut pat_break: Option<RowIndex> = None;
                        let mut ignore_pos_jump = false;
                        let mut ignore_pat_break = false;

                        for ch2 in 0..num_channels {
                            let row_data2 = data.row(ch2, order, row);
                            for effect in &row_data2.effects {
                                match effect.code {
                                    effects::POS_JUMP => {
                                        if ignore_pos_jump {
                                            continue;
                                        }
                                        if effect.value == EFFECT_VALUELESS
                                            || effect.value < 0
                                            || effect.value >= num_orders as i16
                                        {
                                            ignore_pos_jump = true;
                                            continue;
                                        }
                                        pos_jump = Some(effect.value as OrderIndex);
                                        ignore_pos_jump = true;
                                    }
                                    effects::PAT_BREAK => {
                                        if ignore_pat_break {
                                            continue;
                                        }
                                        // A break on the last order does
                                        // nothing
                                        if order + 1 == num_orders {
                                            continue;
                                        }
                                        if effect.value == EFFECT_VALUELESS
                                            || effect.value < 0
                                            || effect.value >= num_rows as i16
                                        {
                                            ignore_pat_break = true;
                                            continue;
                                        }
                                        pat_break = Some(effect.value as RowIndex);
                                        ignore_pat_break = true;
                                    }
                                    _ => {}
                                }
                            }
                        }

                        // An order that starts on a shifted row plays
                        // fewer rows, so its last row needs a break (or a
                        // jump to the start when it is the final order)
                        if row_offset > 0
                            && pat_break.is_none()
                            && pos_jump.is_none()
                            && row + 1 == num_rows
                        {
                            if order + 1 != num_orders {
                                pat_break = Some(0);
                            } else {
                                pos_jump = Some(0);
                            }
                        }

                        if let Some(break_row) = pat_break {
                            // Stored as 0: the next order's rows are
                            // shifted so they start at 0
                            gw.set_one_shot::<global::PatBreak>(0);
                            starting_row[(order + 1) as usize] = break_row;
                            last_row[order as usize] = row + 1;
                            break 'rows;
                        } else if let Some(dest) = pos_jump {
                            if dest > order {
                                // Forward jump: the skipped orders are
                                // unplayable and drop out of the
                                // generated order count entirely
                                let mut to_skip = dest - order - 1;
                                num_orders_skipped += to_skip;
                                while to_skip != 0 {
                                    skipped_orders[(order + to_skip) as usize] = true;
                                    to_skip -= 1;
                                }
                                if row + 1 != num_rows {
                                    gw.set_one_shot::<global::PatBreak>(0);
                                }
                                last_row[order as usize] = row + 1;
                                break 'rows;
                            } else {
                                // A loop. A jump into a skipped order
                                // lands on the next playable one.
                                let mut dest = dest;
                                while skipped_orders[dest as usize] {
                                    dest += 1;
                                    debug_assert!(dest < num_orders);
                                }
                                let dest_pos = position(order_map[dest as usize], 0);
                                loopbacks.push((pos, dest_pos));
                                gw.set_one_shot::<global::PosJump>(order_map[dest as usize]);

                                // Everything after the loop source is
                                // unreachable
                                last_row[order as usize] = row + 1;
                                for later in (order + 1)..num_orders {
                                    skipped_orders[later as usize] = true;
                                }
                                break 'rows;
                            }
                        }
                    }

                    row += 1;
                }

                // Map the next playable DMF order to its generated order
                if ch == 0 {
                    total_gen_orders += 1;
                    let mut next = order + 1;
                    while next < num_orders && skipped_orders[next as usize] {
                        next += 1;
                    }
                    if next < num_orders {
                        order_map[next as usize] = total_gen_orders;
                    }
                }
            }
        }

        let total_orders = num_orders - num_orders_skipped;

        // Position of the last playable row in generated terms
        let last_dmf_order = (0..num_orders)
            .rev()
            .find(|&order| !skipped_orders[order as usize])
            .unwrap_or(0);
        let last_gen_order = order_map[last_dmf_order as usize];
        let last_gen_row =
            last_row[last_dmf_order as usize] - 1 - starting_row[last_dmf_order as usize];
        let last_order_row = position(last_gen_order, last_gen_row);

        let mut gw = StateWriter::new(global_state);

        // A song with no loop gets an implicit jump back to the start
        if loopbacks.is_empty() {
            gw.set_write_pos(last_order_row);
            gw.set_one_shot::<global::PosJump>(0);
            loopbacks.push((last_order_row, 0));
        }

        // Loopbacks are recorded at their destination. Order by
        // destination, then source; one loopback per destination.
        loopbacks.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let mut last_dest: Position = -1;
        for &(from, to) in &loopbacks {
            if last_dest == to {
                continue;
            }
            gw.set_write_pos(to);
            gw.set_one_shot::<global::Loopback>(from);
            last_dest = to;

            if !mod_compat_loops {
                continue;
            }

            // When looping back, a playing note can carry over the loop
            // point. Stop it with an inserted note off where possible.
            for channel_state in channel_states.iter_mut() {
                let mut w = StateWriter::new(channel_state);
                let playing_before = *w.value_at::<channel::NotePlaying>(from);
                if !playing_before {
                    continue;
                }
                let slot_here = w.impulse_at::<channel::NoteCell>(to).copied();
                if matches!(slot_here, Some(slot) if !slot.is_empty()) {
                    continue;
                }
                let playing_now = *w.value_at::<channel::NotePlaying>(to);
                if playing_now {
                    // Deflemask acts as if a note off sits here on the
                    // second pass; ProTracker would need an extra
                    // loopback order to mimic that, so just flag it
                    status |= GENERATE_LOOPBACK_ORDER_NEEDED;
                } else {
                    w.insert::<channel::NoteCell>(to, NoteSlot::Off, true);
                    note_off_used = true;
                }
            }
        }

        let gen = &mut self.generated;
        gen.total_orders = Some(total_orders);
        gen.note_off_used = Some(note_off_used);
        gen.channel_note_extremes = Some(channel_note_extremes);
        gen.sound_index_note_extremes = Some(sound_index_note_extremes);
        gen.sound_indexes_used = Some(sound_indexes_used);
        gen.state = Some(state);
        gen.set_generated(flags);
        gen.set_status(status);
        Ok(status)
    }
}
