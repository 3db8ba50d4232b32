// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire-level types shared by the serial transport, the command encoders,
//! and the message processor.

pub mod checksum;
pub mod commands;

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Firmware protocol version this controller was built against. Modules
/// reporting anything else are refused during the startup handshake.
pub const EXPECTED_FIRMWARE_VERSION: u32 = 3;

/// Addresses one physical motor module. Stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum ModuleId {
    A,
    B,
    C,
    D,
    E,
    F,
    #[serde(skip)]
    Invalid,
}

impl ModuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleId::A => "A",
            ModuleId::B => "B",
            ModuleId::C => "C",
            ModuleId::D => "D",
            ModuleId::E => "E",
            ModuleId::F => "F",
            ModuleId::Invalid => "invalid",
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(ModuleId::A),
            "B" => Ok(ModuleId::B),
            "C" => Ok(ModuleId::C),
            "D" => Ok(ModuleId::D),
            "E" => Ok(ModuleId::E),
            "F" => Ok(ModuleId::F),
            _ => Err(()),
        }
    }
}

/// The kinds of actuator a module can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorType {
    Servo,
    Dynamixel,
    Stepper,
    #[serde(skip)]
    Invalid,
}

/// Identifies one addressable actuator: the module it hangs off, its GPIO
/// pin (or Dynamixel bus id), and what kind of motor it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServoRef {
    pub module: ModuleId,
    pub pin: u16,
    pub motor: MotorType,
}

/// A desired position for one actuator. `ticks` is bounded by the creature
/// configuration upstream; no clamping happens here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoPosition {
    pub servo: ServoRef,
    pub ticks: u32,
}

impl ServoPosition {
    /// The POS token for this position: Dynamixel pins carry a `D` prefix.
    pub fn wire_token(&self) -> String {
        if self.servo.motor == MotorType::Dynamixel {
            format!("D{} {}", self.servo.pin, self.ticks)
        } else {
            format!("{} {}", self.servo.pin, self.ticks)
        }
    }
}

/// One tab-delimited line, without terminator, addressed to or from a
/// specific module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module: ModuleId,
    pub payload: String,
}

impl Frame {
    pub fn new(module: ModuleId, payload: impl Into<String>) -> Self {
        Frame {
            module,
            payload: payload.into(),
        }
    }
}

/// Lifecycle of one module handler.
///
/// The only legal forward path is
/// `Unknown → Idle → AwaitingConfiguration → Configuring → Ready`;
/// `Stopped` is reachable from anywhere and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Unknown,
    Idle,
    AwaitingConfiguration,
    Configuring,
    Ready,
    Stopped,
}

impl HandlerState {
    /// Whether moving from `self` to `next` follows the declared graph.
    /// Re-asserting the current state is always allowed.
    pub fn can_transition(self, next: HandlerState) -> bool {
        use HandlerState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Unknown, Idle) => true,
            (Idle, AwaitingConfiguration) => true,
            (AwaitingConfiguration, Configuring) => true,
            (Configuring, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerState::Unknown => "unknown",
            HandlerState::Idle => "idle",
            HandlerState::AwaitingConfiguration => "awaiting-configuration",
            HandlerState::Configuring => "configuring",
            HandlerState::Ready => "ready",
            HandlerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_round_trips_through_strings() {
        for id in [ModuleId::A, ModuleId::B, ModuleId::C, ModuleId::D, ModuleId::E, ModuleId::F] {
            assert_eq!(id.as_str().parse::<ModuleId>(), Ok(id));
        }
        assert!("G".parse::<ModuleId>().is_err());
        assert!("a".parse::<ModuleId>().is_err());
    }

    #[test]
    fn servo_position_tokens() {
        let servo = ServoPosition {
            servo: ServoRef {
                module: ModuleId::A,
                pin: 3,
                motor: MotorType::Servo,
            },
            ticks: 2048,
        };
        assert_eq!(servo.wire_token(), "3 2048");

        let dxl = ServoPosition {
            servo: ServoRef {
                module: ModuleId::A,
                pin: 4,
                motor: MotorType::Dynamixel,
            },
            ticks: 8100,
        };
        assert_eq!(dxl.wire_token(), "D4 8100");
    }

    #[test]
    fn handler_state_forward_path() {
        use HandlerState::*;
        assert!(Unknown.can_transition(Idle));
        assert!(Idle.can_transition(AwaitingConfiguration));
        assert!(AwaitingConfiguration.can_transition(Configuring));
        assert!(Configuring.can_transition(Ready));
    }

    #[test]
    fn handler_state_rejects_shortcuts() {
        use HandlerState::*;
        assert!(!Idle.can_transition(Ready));
        assert!(!Unknown.can_transition(Configuring));
        assert!(!Ready.can_transition(Idle));
        assert!(!AwaitingConfiguration.can_transition(Ready));
    }

    #[test]
    fn stopped_is_terminal_and_reachable_from_anywhere() {
        use HandlerState::*;
        for state in [Unknown, Idle, AwaitingConfiguration, Configuring, Ready] {
            assert!(state.can_transition(Stopped));
        }
        assert!(!Stopped.can_transition(Idle));
        assert!(!Stopped.can_transition(Ready));
        assert!(Stopped.can_transition(Stopped));
    }
}
