//! Pure phase-threshold evaluation.

use std::fmt;

use crate::event::PhaseReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::L1 => write!(f, "L1"),
            Phase::L2 => write!(f, "L2"),
            Phase::L3 => write!(f, "L3"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offender {
    pub phase: Phase,
    pub amps: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdCheck {
    Within,
    Exceeded(Vec<Offender>),
}

/// Compare each phase against the threshold. Strictly greater-than: a phase
/// sitting exactly on the threshold does not trip. Offenders come back in
/// fixed L1, L2, L3 order.
pub fn check_thresholds(reading: &PhaseReading, threshold: f64) -> ThresholdCheck {
    let mut offenders = Vec::new();
    for (phase, amps) in [
        (Phase::L1, reading.l1),
        (Phase::L2, reading.l2),
        (Phase::L3, reading.l3),
    ] {
        if amps > threshold {
            offenders.push(Offender { phase, amps });
        }
    }
    if offenders.is_empty() {
        ThresholdCheck::Within
    } else {
        ThresholdCheck::Exceeded(offenders)
    }
}

/// Render offenders for the operator notification: `"L1 (26A), L3 (28A)"`.
/// The amperage prints as the integer part of the value as received.
pub fn format_offenders(offenders: &[Offender]) -> String {
    offenders
        .iter()
        .map(|o| format!("{} ({}A)", o.phase, o.amps as i64))
        .collect::<Vec<_>>()
        .join(", ")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn reading(l1: f64, l2: f64, l3: f64) -> PhaseReading {
        PhaseReading {
            l1,
            l2,
            l3,
            at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn all_within_threshold() {
        assert_eq!(
            check_thresholds(&reading(12.0, 7.0, 3.0), 25.0),
            ThresholdCheck::Within
        );
    }

    #[test]
    fn equality_does_not_trip() {
        assert_eq!(
            check_thresholds(&reading(25.0, 25.0, 25.0), 25.0),
            ThresholdCheck::Within
        );
    }

    #[test]
    fn single_offender() {
        match check_thresholds(&reading(28.0, 7.0, 3.0), 25.0) {
            ThresholdCheck::Exceeded(offenders) => {
                assert_eq!(offenders.len(), 1);
                assert_eq!(offenders[0].phase, Phase::L1);
                assert_eq!(offenders[0].amps, 28.0);
            }
            ThresholdCheck::Within => panic!("expected trip"),
        }
    }

    #[test]
    fn offenders_in_fixed_phase_order() {
        match check_thresholds(&reading(26.0, 7.0, 28.0), 25.0) {
            ThresholdCheck::Exceeded(offenders) => {
                assert_eq!(offenders[0].phase, Phase::L1);
                assert_eq!(offenders[1].phase, Phase::L3);
            }
            ThresholdCheck::Within => panic!("expected trip"),
        }
    }

    #[test]
    fn zero_threshold_trips_on_any_current() {
        match check_thresholds(&reading(0.1, 0.0, 0.0), 0.0) {
            ThresholdCheck::Exceeded(offenders) => assert_eq!(offenders.len(), 1),
            ThresholdCheck::Within => panic!("expected trip"),
        }
    }

    #[test]
    fn format_single_offender() {
        let offenders = vec![Offender {
            phase: Phase::L1,
            amps: 28.0,
        }];
        assert_eq!(format_offenders(&offenders), "L1 (28A)");
    }

    #[test]
    fn format_multiple_offenders() {
        let offenders = vec![
            Offender {
                phase: Phase::L1,
                amps: 26.0,
            },
            Offender {
                phase: Phase::L3,
                amps: 28.0,
            },
        ];
        assert_eq!(format_offenders(&offenders), "L1 (26A), L3 (28A)");
    }

    #[test]
    fn format_keeps_integer_part_of_fractional_amps() {
        let offenders = vec![Offender {
            phase: Phase::L2,
            amps: 26.7,
        }];
        assert_eq!(format_offenders(&offenders), "L2 (26A)");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let r = reading(26.0, 30.0, 27.5);
        assert_eq!(check_thresholds(&r, 25.0), check_thresholds(&r, 25.0));
    }
}
