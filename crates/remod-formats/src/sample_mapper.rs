//! DMF instrument to MOD sample mapping.
//!
//! The Game Boy plays C-0 through C-8 while a MOD sample covers three
//! octaves (C-1 to B-3 in ProTracker terms), so one DMF square duty or
//! wavetable can need up to three MOD samples at different lengths. The
//! mapper decides the split, assigns MOD sample ids, and answers which
//! sample and ProTracker note to use for a given DMF note.

use arrayvec::ArrayVec;

use remod_ir::{note_range, Note, NotePitch};

use crate::dmf_format::DmfSoundIndex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleType {
    #[default]
    Silence,
    Square,
    Wave,
}

/// Which of the up-to-three MOD samples a note falls in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoteRange {
    #[default]
    First,
    Second,
    Third,
}

impl NoteRange {
    pub const fn index(self) -> usize {
        match self {
            NoteRange::First => 0,
            NoteRange::Second => 1,
            NoteRange::Third => 2,
        }
    }
}

/// Printable name of a note range within its collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteRangeName {
    None,
    Low,
    Middle,
    High,
}

/// Maps one DMF timbre source onto 1-3 MOD samples.
#[derive(Clone, Debug, Default)]
pub struct SampleMapper {
    dmf_index: DmfSoundIndex,
    sample_type: SampleType,
    num_mod_samples: usize,
    range_starts: ArrayVec<Note, 3>,
    lengths: [u32; 3],
    mod_ids: [u8; 3],
    downsampling_needed: bool,
    octave_shift: u8,
}

/// Base MOD sample length for a range starting at C of the given octave.
/// DMF wavetables hold 32 entries, so wave lengths below 32 lose
/// information to downsampling.
const OCTAVE_TO_LENGTH: [u32; 6] = [256, 128, 64, 32, 16, 8];

impl SampleMapper {
    /// Decide the split for a square or wave sound with the observed note
    /// extremes, assigning MOD ids from `starting_id` up. Returns the
    /// mapper and the next free MOD sample id.
    pub fn init(
        dmf_index: DmfSoundIndex,
        starting_id: u8,
        lowest_note: Note,
        highest_note: Note,
    ) -> (Self, u8) {
        if dmf_index == DmfSoundIndex::None {
            return Self::init_silence();
        }

        let sample_type = match dmf_index {
            DmfSoundIndex::Wave(_) => SampleType::Wave,
            _ => SampleType::Square,
        };
        let is_wave = sample_type == SampleType::Wave;
        let mut mapper = SampleMapper {
            dmf_index,
            sample_type,
            ..SampleMapper::default()
        };

        // Note ranges always start on a C
        let lowest_nearest_c = Note::new(NotePitch::C, lowest_note.octave);

        let range = note_range(lowest_nearest_c, highest_note);
        mapper.num_mod_samples = if range <= 36 {
            1
        } else if range <= 72 {
            2
        } else {
            3
        };

        if mapper.num_mod_samples == 3 {
            // A full-range split is always the same three samples
            mapper.range_starts.push(Note::new(NotePitch::C, 0));
            mapper.range_starts.push(Note::new(NotePitch::C, 2));
            mapper.range_starts.push(Note::new(NotePitch::C, 5));
            mapper.lengths = [256, 64, 8];
            if is_wave {
                // Wave samples sound an octave high otherwise
                for length in &mut mapper.lengths {
                    *length *= 2;
                }
            }
            mapper.downsampling_needed = is_wave;
            mapper.mod_ids = [starting_id, starting_id + 1, starting_id + 2];
            return (mapper, starting_id + 3);
        }

        // With one or two samples there may be room to shift the range
        // start down an octave or two, avoiding downsampling
        let mut high_end = lowest_nearest_c;
        high_end.octave += 3;
        if mapper.num_mod_samples == 2 {
            high_end.octave += 3;
        }
        debug_assert!(high_end > highest_note);

        let high_end_slack = note_range(highest_note, high_end);
        let mut shift = 0u8;
        if high_end_slack > 12 && lowest_nearest_c.octave >= 1 {
            shift = 1;
        }
        if high_end_slack > 24 && lowest_nearest_c.octave >= 1 {
            shift = 2;
        }
        let range_start = Note::new(NotePitch::C, lowest_nearest_c.octave - shift.min(lowest_nearest_c.octave));
        mapper.octave_shift = shift;

        mapper.range_starts.push(range_start);
        mapper.lengths[0] = OCTAVE_TO_LENGTH[range_start.octave.min(5) as usize];
        if is_wave {
            mapper.lengths[0] *= 2;
        }
        mapper.downsampling_needed = is_wave && mapper.lengths[0] < 32;
        mapper.mod_ids[0] = starting_id;

        if mapper.num_mod_samples == 2 {
            let second_start = Note::new(NotePitch::C, range_start.octave + 3);
            mapper.range_starts.push(second_start);
            mapper.lengths[1] = OCTAVE_TO_LENGTH[second_start.octave.min(5) as usize];
            if is_wave {
                mapper.lengths[1] *= 2;
            }
            if is_wave && mapper.lengths[1] < 32 {
                mapper.downsampling_needed = true;
            }
            mapper.mod_ids[1] = starting_id + 1;
            return (mapper, starting_id + 2);
        }

        (mapper, starting_id + 1)
    }

    /// The silent sample: 8 bytes of zeros, always MOD sample 1.
    pub fn init_silence() -> (Self, u8) {
        let mapper = SampleMapper {
            dmf_index: DmfSoundIndex::None,
            sample_type: SampleType::Silence,
            num_mod_samples: 1,
            range_starts: ArrayVec::new(),
            lengths: [8, 0, 0],
            mod_ids: [1, 0, 0],
            downsampling_needed: false,
            octave_shift: 0,
        };
        (mapper, 2)
    }

    pub fn dmf_index(&self) -> DmfSoundIndex {
        self.dmf_index
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn num_mod_samples(&self) -> usize {
        self.num_mod_samples
    }

    pub fn downsampling_needed(&self) -> bool {
        self.downsampling_needed
    }

    pub fn octave_shift(&self) -> u8 {
        self.octave_shift
    }

    pub fn first_mod_sample_id(&self) -> u8 {
        self.mod_ids[0]
    }

    /// Which of this mapper's MOD samples covers the given DMF note.
    pub fn note_range_for(&self, dmf_note: Note) -> NoteRange {
        if self.num_mod_samples == 1 {
            return NoteRange::First;
        }
        if dmf_note.octave < self.range_starts[1].octave {
            NoteRange::First
        } else if self.num_mod_samples == 2 || dmf_note.octave < self.range_starts[2].octave {
            NoteRange::Second
        } else {
            NoteRange::Third
        }
    }

    /// The ProTracker note to write for a DMF note, and which MOD sample
    /// it plays on. The octave is what ProTracker displays: 1-3, with 0
    /// and 4 possible but non-standard.
    pub fn mod_note(&self, dmf_note: Note) -> (Note, NoteRange) {
        if self.sample_type == SampleType::Silence {
            return (Note::new(NotePitch::C, 0), NoteRange::First);
        }

        let range = self.note_range_for(dmf_note);
        let range_start = self.range_starts[range.index()];
        // The octave shift is already folded into the range start; the +1
        // is because MOD's range starts at C-1, not C-0
        let octave = (dmf_note.octave as i32 - range_start.octave as i32 + 1).clamp(0, 4) as u8;
        (Note::new(dmf_note.pitch, octave), range)
    }

    pub fn mod_sample_id(&self, range: NoteRange) -> u8 {
        debug_assert!(range.index() < self.num_mod_samples);
        self.mod_ids[range.index()]
    }

    pub fn mod_sample_length(&self, range: NoteRange) -> u32 {
        debug_assert!(range.index() < self.num_mod_samples);
        self.lengths[range.index()]
    }

    /// Name of a range for sample naming purposes.
    pub fn range_name(&self, range: NoteRange) -> NoteRangeName {
        match range {
            NoteRange::First => {
                if self.num_mod_samples == 1 {
                    NoteRangeName::None
                } else {
                    NoteRangeName::Low
                }
            }
            NoteRange::Second => {
                if self.num_mod_samples == 2 {
                    NoteRangeName::High
                } else {
                    NoteRangeName::Middle
                }
            }
            NoteRange::Third => NoteRangeName::High,
        }
    }
}

/// Synthesize a square wave of the given duty cycle (0-3) and length.
pub fn square_wave_sample(duty_cycle: u8, length: u32) -> Vec<i8> {
    const DUTY: [u32; 4] = [1, 2, 4, 6];
    let duty = DUTY[duty_cycle as usize % 4];
    (1..=length)
        .map(|i| if i * 8 <= duty * length { 127 } else { -10 })
        .collect()
}

/// Resample a 32-entry 4-bit DMF wavetable to the given length as signed
/// 8-bit PCM. Upsampling replicates entries; downsampling averages 2 or 4
/// neighbours. Output is capped at 12/15 of full scale to match the
/// Game Boy wave channel's output level.
pub fn wavetable_sample(values: &[u32], length: u32) -> Vec<i8> {
    const MAX_VOL_CAP: f32 = 12.0 / 15.0;
    let scale = |sum: u32, count: u32| -> i8 {
        ((sum as f32 / (15.0 * count as f32) * 255.0 - 128.0) * MAX_VOL_CAP) as i8
    };

    let value_at = |i: usize| values.get(i).copied().unwrap_or(0);
    (0..length as usize)
        .map(|i| match length {
            512 => scale(value_at(i / 16), 1),
            256 => scale(value_at(i / 8), 1),
            128 => scale(value_at(i / 4), 1),
            64 => scale(value_at(i / 2), 1),
            32 => scale(value_at(i), 1),
            16 => scale(value_at(i * 2) + value_at(i * 2 + 1), 2),
            8 => scale(
                value_at(i * 4)
                    + value_at(i * 4 + 1)
                    + value_at(i * 4 + 2)
                    + value_at(i * 4 + 3),
                4,
            ),
            _ => 0,
        })
        .collect()
}

/// A silent sample of the given length.
pub fn silence_sample(length: u32) -> Vec<i8> {
    vec![0; length as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: NotePitch, octave: u8) -> Note {
        Note::new(pitch, octave)
    }

    #[test]
    fn silence_is_always_sample_one() {
        let (mapper, next) = SampleMapper::init_silence();
        assert_eq!(mapper.sample_type(), SampleType::Silence);
        assert_eq!(mapper.num_mod_samples(), 1);
        assert_eq!(mapper.first_mod_sample_id(), 1);
        assert_eq!(mapper.mod_sample_length(NoteRange::First), 8);
        assert_eq!(next, 2);
    }

    #[test]
    fn three_octave_square_fits_one_sample() {
        // C-2 through B-4 on a square duty: exactly three octaves
        let (mapper, next) = SampleMapper::init(
            DmfSoundIndex::Square(1),
            2,
            note(NotePitch::C, 2),
            note(NotePitch::B, 4),
        );
        assert_eq!(mapper.num_mod_samples(), 1);
        assert_eq!(mapper.mod_sample_length(NoteRange::First), 64);
        assert_eq!(mapper.octave_shift(), 0);
        assert!(!mapper.downsampling_needed());
        assert_eq!(next, 3);

        // Every note in the range maps into ProTracker octaves 1-3
        for octave in 2..=4u8 {
            for pitch in 0..12u8 {
                let dmf = note(NotePitch::from_index(pitch).unwrap(), octave);
                let (mod_note, range) = mapper.mod_note(dmf);
                assert_eq!(range, NoteRange::First);
                assert!((1..=3).contains(&mod_note.octave), "octave {octave} pitch {pitch}");
                assert_eq!(mod_note.pitch, dmf.pitch);
            }
        }
        assert_eq!(mapper.mod_note(note(NotePitch::C, 2)).0, note(NotePitch::C, 1));
        assert_eq!(mapper.mod_note(note(NotePitch::B, 4)).0, note(NotePitch::B, 3));
    }

    #[test]
    fn wide_wavetable_splits_three_ways() {
        // C-1 through C-7 on a wavetable: 73 semitones, three samples
        let (mapper, next) = SampleMapper::init(
            DmfSoundIndex::Wave(0),
            5,
            note(NotePitch::C, 1),
            note(NotePitch::C, 7),
        );
        assert_eq!(mapper.num_mod_samples(), 3);
        assert_eq!(mapper.mod_sample_length(NoteRange::First), 512);
        assert_eq!(mapper.mod_sample_length(NoteRange::Second), 128);
        assert_eq!(mapper.mod_sample_length(NoteRange::Third), 16);
        assert!(mapper.downsampling_needed());
        assert_eq!(mapper.mod_sample_id(NoteRange::Third), 7);
        assert_eq!(next, 8);

        // Range membership at the fixed C-0/C-2/C-5 split points
        assert_eq!(mapper.note_range_for(note(NotePitch::B, 1)), NoteRange::First);
        assert_eq!(mapper.note_range_for(note(NotePitch::C, 2)), NoteRange::Second);
        assert_eq!(mapper.note_range_for(note(NotePitch::B, 4)), NoteRange::Second);
        assert_eq!(mapper.note_range_for(note(NotePitch::C, 5)), NoteRange::Third);

        assert_eq!(mapper.range_name(NoteRange::First), NoteRangeName::Low);
        assert_eq!(mapper.range_name(NoteRange::Second), NoteRangeName::Middle);
        assert_eq!(mapper.range_name(NoteRange::Third), NoteRangeName::High);
    }

    #[test]
    fn octave_shift_avoids_downsampling() {
        // C-3..E-4 fits one sample with lots of headroom above, so the
        // range start shifts down an octave and the sample doubles
        let (mapper, _) = SampleMapper::init(
            DmfSoundIndex::Square(0),
            1,
            note(NotePitch::C, 3),
            note(NotePitch::E, 4),
        );
        assert_eq!(mapper.num_mod_samples(), 1);
        assert_eq!(mapper.octave_shift(), 1);
        assert_eq!(mapper.mod_sample_length(NoteRange::First), 64);
        assert_eq!(mapper.mod_note(note(NotePitch::E, 4)).0, note(NotePitch::E, 3));
    }

    #[test]
    fn high_wavetable_without_shift_needs_downsampling() {
        // C-5..B-7 wavetable: range start C-5 wants an 8-byte sample
        // (16 after the wave doubling), below the 32-entry table
        let (mapper, _) = SampleMapper::init(
            DmfSoundIndex::Wave(2),
            1,
            note(NotePitch::C, 5),
            note(NotePitch::B, 7),
        );
        assert_eq!(mapper.num_mod_samples(), 1);
        assert_eq!(mapper.octave_shift(), 0);
        assert_eq!(mapper.mod_sample_length(NoteRange::First), 16);
        assert!(mapper.downsampling_needed());
    }

    #[test]
    fn two_sample_split_covers_both_ranges() {
        // C-2..B-5: 48 semitones from the nearest C, two samples, and
        // enough headroom above to shift down two octaves
        let (mapper, next) = SampleMapper::init(
            DmfSoundIndex::Square(3),
            4,
            note(NotePitch::C, 2),
            note(NotePitch::B, 5),
        );
        assert_eq!(mapper.num_mod_samples(), 2);
        assert_eq!(mapper.octave_shift(), 2);
        assert_eq!(next, 6);
        let (low_note, low_range) = mapper.mod_note(note(NotePitch::C, 2));
        let (high_note, high_range) = mapper.mod_note(note(NotePitch::B, 5));
        assert_eq!(low_range, NoteRange::First);
        assert_eq!(high_range, NoteRange::Second);
        assert_eq!(low_note.octave, 3);
        assert_eq!(high_note.octave, 3);
        assert_eq!(mapper.range_name(NoteRange::Second), NoteRangeName::High);
    }

    #[test]
    fn square_wave_shape() {
        // Duty index 2 is 50%: half high, half low
        let sample = square_wave_sample(2, 32);
        assert_eq!(sample.len(), 32);
        assert!(sample[..16].iter().all(|&v| v == 127));
        assert!(sample[16..].iter().all(|&v| v == -10));

        // Duty index 0 is 12.5%
        let sample = square_wave_sample(0, 64);
        assert!(sample[..8].iter().all(|&v| v == 127));
        assert!(sample[8..].iter().all(|&v| v == -10));
    }

    #[test]
    fn wavetable_identity_and_resampling() {
        let table: Vec<u32> = (0..32).map(|i| (i % 16) as u32).collect();

        let same = wavetable_sample(&table, 32);
        assert_eq!(same.len(), 32);
        // Full-scale 15 maps to 12/15 of +127
        let max = wavetable_sample(&[15; 32], 32);
        assert!(max.iter().all(|&v| v == 101));
        // Zero maps to the capped negative end
        let min = wavetable_sample(&[0; 32], 32);
        assert!(min.iter().all(|&v| v == -102));

        // Upsampling doubles each entry
        let up = wavetable_sample(&table, 64);
        assert_eq!(up.len(), 64);
        assert_eq!(up[0], up[1]);
        assert_eq!(up[0], same[0]);

        // Downsampling to 16 averages pairs
        let down = wavetable_sample(&[0, 15].repeat(16), 16);
        assert_eq!(down.len(), 16);
        let expected = ((15.0 / 30.0 * 255.0 - 128.0) * (12.0 / 15.0)) as i8;
        assert!(down.iter().all(|&v| v == expected));
    }

    #[test]
    fn silence_sample_is_zeroed() {
        assert_eq!(silence_sample(8), vec![0i8; 8]);
    }
}
