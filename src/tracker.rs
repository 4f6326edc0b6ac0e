use std::time::{Duration, Instant};

use crate::status::ChargeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<ChargeState>,
    pub to: ChargeState,
}

impl Transition {
    pub fn mains_lost(&self) -> bool {
        self.to == ChargeState::Discharging
    }

    pub fn mains_restored(&self) -> bool {
        self.from == Some(ChargeState::Discharging)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimate {
    UntilFull(Duration),
    UntilEmpty(Duration),
}

/// Reported once when the output rail crosses the low-voltage threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAlarm {
    Low(u32),
    Recovered(u32),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Observation {
    pub transition: Option<Transition>,
    pub estimate: Option<Estimate>,
    pub output: Option<OutputAlarm>,
}

// Start of the current charge or discharge run.
#[derive(Debug, Clone, Copy)]
struct Segment {
    at: Instant,
    capacity: u8,
}

/// Follows readings across cycles to report state changes, time estimates and a sagging
/// output rail.
///
/// Classification itself stays stateless; this only looks at the sequence of results.
#[derive(Debug)]
pub struct ChargeTracker {
    low_output_mv: u32,
    output_low: bool,
    last_state: Option<ChargeState>,
    last_capacity: Option<u8>,
    segment: Option<Segment>,
    estimate: Option<Estimate>,
}

impl ChargeTracker {
    pub fn new(low_output_mv: u32) -> ChargeTracker {
        ChargeTracker {
            low_output_mv,
            output_low: false,
            last_state: None,
            last_capacity: None,
            segment: None,
            estimate: None,
        }
    }

    pub fn observe(
        &mut self,
        state: ChargeState,
        batcap: &str,
        vout: &str,
        now: Instant,
    ) -> Observation {
        let capacity: Option<u8> = batcap.trim().parse().ok().filter(|c| *c <= 100);

        let mut transition = None;
        if self.last_state != Some(state) {
            transition = Some(Transition {
                from: self.last_state,
                to: state,
            });
            self.segment = capacity.map(|capacity| Segment { at: now, capacity });
            self.estimate = None;
        } else if capacity != self.last_capacity {
            self.estimate = match (self.segment, capacity) {
                (Some(segment), Some(current)) => estimate(state, segment, current, now),
                _ => None,
            }
            .or(self.estimate);
            if self.segment.is_none() {
                self.segment = capacity.map(|capacity| Segment { at: now, capacity });
            }
        }

        self.last_state = Some(state);
        self.last_capacity = capacity;

        Observation {
            transition,
            estimate: self.estimate,
            output: self.check_output(vout),
        }
    }

    // Non-numeric readings leave the alarm where it was.
    fn check_output(&mut self, vout: &str) -> Option<OutputAlarm> {
        let millivolts: u32 = vout.trim().parse().ok()?;
        let low = millivolts < self.low_output_mv;
        if low == self.output_low {
            return None;
        }
        self.output_low = low;
        if low {
            Some(OutputAlarm::Low(millivolts))
        } else {
            Some(OutputAlarm::Recovered(millivolts))
        }
    }
}

// Linear extrapolation from the start of the run, ignoring the first point of movement.
fn estimate(state: ChargeState, segment: Segment, current: u8, now: Instant) -> Option<Estimate> {
    let elapsed = now.checked_duration_since(segment.at)?;
    if elapsed.is_zero() {
        return None;
    }

    let start = u32::from(segment.capacity);
    let current = u32::from(current);
    match state {
        ChargeState::Charging if current > start + 1 => {
            let per_point = elapsed / (current - start - 1);
            Some(Estimate::UntilFull(per_point * (100 - current)))
        }
        ChargeState::Discharging if start > current + 1 => {
            let per_point = elapsed / (start - current - 1);
            Some(Estimate::UntilEmpty(per_point * current))
        }
        _ => None,
    }
}
