//! DMF BPM to MOD tempo/speed conversion.
//!
//! A MOD plays at `3 * tempo / speed` BPM with tempo in 33..=255 and
//! speed in 1..=32. The DMF BPM arrives as a fraction; after reducing it,
//! a case table classifies how far out of range the numerator and
//! denominator are and either rescales, falls back to the nearest
//! extreme, or brute-forces the closest representable pair.

/// How the chosen pair deviates from the requested BPM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempoWarning {
    /// Requested BPM is below what MOD can play; clamped up.
    Low,
    /// Requested BPM is above what MOD can play; clamped down.
    High,
    /// In range, but not exactly representable.
    Precision,
}

const NUM_LOW: u32 = 1;
const NUM_HIGH: u32 = 2;
const DEN_HIGH: u32 = 8;

fn gcd(u: u32, v: u32) -> u32 {
    if v == 0 {
        u
    } else {
        gcd(v, u % v)
    }
}

/// Brute-force the `(tempo, speed)` pair closest to the desired BPM.
/// Returns `None` when no pair plays anywhere near it.
fn closest_tempo_and_speed(desired_bpm: f64) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32)> = None;
    let mut best_diff = f64::INFINITY;

    for speed in 1..=32u32 {
        if 3.0 * 33.0 / speed as f64 > desired_bpm || desired_bpm > 3.0 * 255.0 / speed as f64 {
            continue;
        }
        for tempo in 33..=255u32 {
            let bpm = 3.0 * tempo as f64 / speed as f64;
            let diff = (desired_bpm - bpm).abs();
            if diff < best_diff {
                best = Some((tempo, speed));
                best_diff = diff;
            }
        }
    }

    best
}

/// Convert a BPM fraction into a MOD `(tempo, speed)` pair as close to
/// the requested BPM as possible.
pub fn tempo_and_speed(
    bpm_numerator: u32,
    bpm_denominator: u32,
) -> (u32, u32, Option<TempoWarning>) {
    // DMF tempo numerators always divide cleanly by 3
    let mut n = bpm_numerator / 3;
    let mut d = bpm_denominator;

    loop {
        let div = gcd(n, d);
        if div <= 1 || n == 0 || d == 0 {
            break;
        }
        n /= div;
        d /= div;
    }

    let mut status = 0;
    if n < 33 {
        status |= NUM_LOW;
    }
    if n > 255 {
        status |= NUM_HIGH;
    }
    // The denominator has no lower limit
    if d > 32 {
        status |= DEN_HIGH;
    }

    let (tempo, speed, warning) = match status {
        0 => (n, d, None),

        NUM_LOW => {
            // Try to scale both up into range
            let mut multiplier = 255 / n;
            while multiplier > 1 && d * multiplier > 32 {
                multiplier -= 1;
            }
            if multiplier <= 1 || n * multiplier < 33 {
                // The numerator cannot be raised without pushing the
                // denominator out of range; even the lowest playable BPM
                // is too fast
                (33, 32, Some(TempoWarning::Low))
            } else {
                (n * multiplier, d * multiplier, None)
            }
        }

        NUM_HIGH => match closest_tempo_and_speed(bpm_numerator as f64 / bpm_denominator as f64) {
            Some((tempo, speed)) => (tempo, speed, Some(TempoWarning::Precision)),
            None => (255, 1, Some(TempoWarning::High)),
        },

        DEN_HIGH => {
            // Pin the denominator at its maximum and rescale
            let scaled_n = (n as f64 / (d as f64 / 32.0)) as u32;
            if scaled_n < 33 {
                (33, 32, Some(TempoWarning::Low))
            } else {
                (scaled_n, 32, Some(TempoWarning::Precision))
            }
        }

        s if s == (NUM_LOW | DEN_HIGH) => (33, 32, Some(TempoWarning::Low)),

        s if s == (NUM_HIGH | DEN_HIGH) => {
            let scaled_n = (n as f64 / (d as f64 / 32.0)) as u32;
            let scaled_d = (d as f64 / (n as f64 / 255.0)) as u32;
            if (33..=255).contains(&scaled_n) {
                (scaled_n, 32, Some(TempoWarning::Precision))
            } else if (1..=32).contains(&scaled_d) {
                (255, scaled_d, Some(TempoWarning::Precision))
            } else {
                (33, 32, Some(TempoWarning::Low))
            }
        }

        _ => unreachable!("NUM_LOW and NUM_HIGH are mutually exclusive"),
    };

    // Speed 0 and 1 behave identically in ProTracker; prefer 1
    (tempo, speed.max(1), warning)
}

/// Effect-compatibility mode: keep the standard speed of 6 so `Fxx`
/// values stay in tempo territory, and set tempo to twice the BPM,
/// clamped to what ProTracker accepts.
pub fn compat_tempo(bpm: f64) -> (u32, u32, Option<TempoWarning>) {
    let doubled = bpm * 2.0;
    if doubled > 255.0 {
        (255, 6, Some(TempoWarning::High))
    } else if doubled < 32.0 {
        (32, 6, Some(TempoWarning::Low))
    } else {
        let tempo = doubled.round() as u32;
        let warning = (doubled.round() - doubled).abs() > f64::EPSILON;
        (tempo, 6, warning.then_some(TempoWarning::Precision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_bpm_conversions() {
        // 180 BPM: 3 * 60 / 1
        assert_eq!(tempo_and_speed(180, 1), (60, 1, None));
        // 150 BPM: n = 50, within range as-is
        assert_eq!(tempo_and_speed(150, 1), (50, 1, None));
        // The default 75 BPM module: n = 25 is too low, scaled up by 10
        let (tempo, speed, warning) = tempo_and_speed(900, 12);
        assert_eq!(3 * tempo, 75 * speed);
        assert_eq!(warning, None);
    }

    #[test]
    fn low_bpm_clamps_to_slowest_pair() {
        // 1 BPM cannot be scaled into range
        let (tempo, speed, warning) = tempo_and_speed(3, 1);
        assert_eq!((tempo, speed), (33, 32));
        assert_eq!(warning, Some(TempoWarning::Low));
    }

    #[test]
    fn high_bpm_clamps_or_approximates() {
        // 400 BPM: numerator too high, brute-forced to 399 BPM
        let (tempo, speed, warning) = tempo_and_speed(1200, 3);
        assert_eq!((tempo, speed), (133, 1));
        assert_eq!(warning, Some(TempoWarning::Precision));

        // Far beyond anything playable
        let (tempo, speed, warning) = tempo_and_speed(3_000_000, 1);
        assert_eq!((tempo, speed), (255, 1));
        assert_eq!(warning, Some(TempoWarning::High));
    }

    #[test]
    fn output_always_within_mod_limits() {
        // Sweep the reachable speed-setting space: global tick 50/60,
        // time base 1..=4, tick times 1..=16
        for global_tick in [50u32, 60] {
            for time_base in 1..=4u32 {
                for t1 in 1..=16u32 {
                    for t2 in 1..=16u32 {
                        let numerator = 15 * global_tick;
                        let denominator = time_base * (t1 + t2);
                        let (tempo, speed, _) = tempo_and_speed(numerator, denominator);
                        assert!((33..=255).contains(&tempo), "tempo {tempo} out of range");
                        assert!((1..=32).contains(&speed), "speed {speed} out of range");
                    }
                }
            }
        }
    }

    #[test]
    fn brute_force_finds_minimal_error() {
        let desired = 190.0;
        let (tempo, speed) = closest_tempo_and_speed(desired).unwrap();
        let chosen = (3.0 * tempo as f64 / speed as f64 - desired).abs();
        for s in 1..=32u32 {
            for t in 33..=255u32 {
                let diff = (3.0 * t as f64 / s as f64 - desired).abs();
                assert!(chosen <= diff + 1e-12);
            }
        }
    }

    #[test]
    fn compat_mode_keeps_speed_six() {
        assert_eq!(compat_tempo(75.0), (150, 6, None));
        assert_eq!(compat_tempo(200.0), (255, 6, Some(TempoWarning::High)));
        assert_eq!(compat_tempo(10.0), (32, 6, Some(TempoWarning::Low)));
        let (tempo, speed, warning) = compat_tempo(62.7);
        assert_eq!(speed, 6);
        assert_eq!(tempo, 125);
        assert_eq!(warning, Some(TempoWarning::Precision));
    }
}
