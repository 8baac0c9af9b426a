//! Peristaltic pump built from three valves.
//!
//! The firmware cycles the three valves itself; the host only sends the run
//! command and later either waits `cycles / rate` seconds or stops it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Highest accepted pump rate in cycles per second.
pub const MAX_RATE: i64 = 999;
/// Highest accepted finite cycle count.
pub const MAX_CYCLES: i64 = 999_999;
/// Cycle count meaning "until stopped".
pub const INDEFINITE: i64 = -1;

/// Order in which the three valves are cycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpDirection {
    /// Valve 1 → 2 → 3
    #[default]
    Forward,
    /// Valve 3 → 2 → 1
    Reverse,
}

impl PumpDirection {
    /// Wire code.
    pub fn code(self) -> char {
        match self {
            PumpDirection::Forward => 'f',
            PumpDirection::Reverse => 'r',
        }
    }
}

/// Three distinct valves acting as one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pump {
    valves: [u8; 3],
}

impl Pump {
    /// Build a pump, rejecting repeated valves.
    pub fn new(valves: [u8; 3]) -> Result<Self, String> {
        let [a, b, c] = valves;
        if a == b || b == c || a == c {
            return Err("There are duplicate valve entries".to_string());
        }
        Ok(Self { valves })
    }

    /// The three valves in order.
    pub fn valves(&self) -> [u8; 3] {
        self.valves
    }

    /// True if `pin` is one of this pump's valves.
    pub fn uses(&self, pin: u8) -> bool {
        self.valves.contains(&pin)
    }
}

impl fmt::Display for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pump({}, {}, {})",
            self.valves[0], self.valves[1], self.valves[2]
        )
    }
}

/// Validated rate and cycle count for one pump sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpRun {
    /// Cycles per second, 1..=999
    pub rate: u16,
    /// 1..=999999, or -1 for indefinite
    pub cycles: i32,
}

impl PumpRun {
    /// True when the sequence only ends on an explicit stop.
    pub fn is_indefinite(&self) -> bool {
        i64::from(self.cycles) == INDEFINITE
    }

    /// How long the firmware needs to finish, `None` when indefinite.
    pub fn duration(&self) -> Option<Duration> {
        if self.is_indefinite() {
            None
        } else {
            Some(Duration::from_secs_f64(
                f64::from(self.cycles) / f64::from(self.rate),
            ))
        }
    }
}

/// Check rate and cycles. `-1` cycles are only accepted when `terminal` is set.
pub fn check_rate_cycles(rate: i64, cycles: i64, terminal: bool) -> Result<PumpRun, String> {
    if !(1..=MAX_RATE).contains(&rate) {
        return Err(format!(
            "{rate} is not a valid rate for a pump step. Rates must be integers from 1 to {MAX_RATE}."
        ));
    }
    if cycles == INDEFINITE {
        if !terminal {
            return Err("Pump steps can pump indefinitely only if they \
                        are the final step in a protocol."
                .to_string());
        }
    } else if !(1..=MAX_CYCLES).contains(&cycles) {
        return Err(format!(
            "{cycles} is not a valid number of cycles for a pump step. The number of cycles must be \
             an integer from 1 to {MAX_CYCLES}, or -1 on the final step of a protocol to pump indefinitely."
        ));
    }
    // Both ranges were checked above.
    Ok(PumpRun {
        rate: rate as u16,
        cycles: cycles as i32,
    })
}
