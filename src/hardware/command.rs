//! Wire encoding for the valve controller firmware.
//!
//! Every frame is ASCII and ends with the terminator `'c'`:
//!
//! | Command   | Body                                                   |
//! |-----------|--------------------------------------------------------|
//! | Handshake | `1`                                                    |
//! | Set pin   | `0` + 2-digit pin + state                              |
//! | Set pins  | `2` + (2-digit pin + state)*                           |
//! | Pump      | `3` + `f`/`r` + 3 × 3-digit valve + 3-digit rate + 6-char cycles |
//! | Stop      | empty (the bare terminator)                            |

use crate::hardware::pump::PumpDirection;

/// Frame terminator understood by the firmware.
pub const TERMINATOR: char = 'c';

/// A command the controller understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Ask the firmware to identify itself.
    Handshake,
    /// Drive one pin.
    SetPin {
        /// Pin address
        pin: u8,
        /// Energized or not
        state: bool,
    },
    /// Drive several pins in one frame.
    SetPins(Vec<(u8, bool)>),
    /// Start a pump sequence.
    RunPump {
        /// Cycle direction
        direction: PumpDirection,
        /// The three pump valves, in order
        valves: [u8; 3],
        /// Cycles per second
        rate: u16,
        /// Number of cycles, -1 for indefinite
        cycles: i32,
    },
    /// Stop whatever pump sequence is running.
    Stop,
}

impl DeviceCommand {
    /// Encode the full frame including the terminator.
    pub fn encode(&self) -> String {
        let mut frame = match self {
            DeviceCommand::Handshake => "1".to_string(),
            DeviceCommand::SetPin { pin, state } => {
                format!("0{:02}{}", pin, u8::from(*state))
            }
            DeviceCommand::SetPins(pins) => {
                let mut body = String::with_capacity(1 + pins.len() * 3);
                body.push('2');
                for (pin, state) in pins {
                    body.push_str(&format!("{:02}{}", pin, u8::from(*state)));
                }
                body
            }
            DeviceCommand::RunPump {
                direction,
                valves,
                rate,
                cycles,
            } => format!(
                "3{}{:03}{:03}{:03}{:03}{:0>6}",
                direction.code(),
                valves[0],
                valves[1],
                valves[2],
                rate,
                cycles
            ),
            DeviceCommand::Stop => String::new(),
        };
        frame.push(TERMINATOR);
        frame
    }
}
