// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Encoders for the commands the controller sends to a module.
//!
//! Every encoder produces a single tab-delimited line; the checksummed
//! variants append `\tCS <u16>` (see [`super::checksum`]). FLUSH is the one
//! exception: a single out-of-band bell byte the firmware uses to resync
//! its input buffer, never framed or checksummed.

use creature_common::{ControllerError, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

use super::checksum;
use super::{MotorType, ServoPosition};
use crate::config::CreatureConfig;
use crate::protocol::ModuleId;

/// The bell byte. Tells the firmware to discard its input buffer and
/// resynchronize on the next newline.
pub const FLUSH: &str = "\u{7}";

/// A batch of servo targets for one module, encoded as
/// `POS\t<pin> <ticks>[\t…]`.
#[derive(Debug, Default)]
pub struct PositionCommand {
    positions: Vec<ServoPosition>,
}

impl PositionCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one target. The same actuator may not appear twice in a batch;
    /// callers are expected to deduplicate before encoding.
    pub fn add(&mut self, position: ServoPosition) -> Result<()> {
        if self.positions.iter().any(|p| p.servo == position.servo) {
            return Err(ControllerError::InvalidArgument(format!(
                "duplicate servo ref: module {} pin {}",
                position.servo.module, position.servo.pin
            )));
        }
        trace!(token = %position.wire_token(), "added servo position");
        self.positions.push(position);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// The bare line, or an empty string for an empty batch (an empty POS
    /// must never reach the wire).
    pub fn to_message(&self) -> String {
        if self.positions.is_empty() {
            warn!("encoding an empty position command yields nothing");
            return String::new();
        }
        let mut message = String::from("POS");
        for position in &self.positions {
            message.push('\t');
            message.push_str(&position.wire_token());
        }
        message
    }

    pub fn to_message_with_checksum(&self) -> String {
        let message = self.to_message();
        if message.is_empty() {
            return message;
        }
        checksum::append(&message)
    }
}

/// `ESTOP\t1`. The `1` is a placeholder; the firmware's parser requires at
/// least one parameter after the tag.
pub fn emergency_stop() -> String {
    "ESTOP\t1".to_string()
}

pub fn emergency_stop_with_checksum() -> String {
    checksum::append(&emergency_stop())
}

/// `PING\t<epoch_seconds>`. The caller records the send instant so the
/// matching PONG can report a round-trip time.
pub fn ping(epoch_seconds: u64) -> String {
    format!("PING\t{epoch_seconds}")
}

pub fn ping_with_checksum(epoch_seconds: u64) -> String {
    checksum::append(&ping(epoch_seconds))
}

/// A PING stamped with the current wall clock.
pub fn ping_now() -> String {
    let epoch_seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ping(epoch_seconds)
}

/// Per-servo calibration and limits for one module, sent in response to the
/// firmware's INIT handshake:
/// `CONFIG\t<count>[\t<pin|Dpin> <min_ticks> <max_ticks>]…`.
#[derive(Debug)]
pub struct ServoModuleConfiguration {
    tokens: Vec<String>,
}

impl ServoModuleConfiguration {
    /// Gathers the configured servos for `module` from the creature model.
    pub fn from_creature(creature: &CreatureConfig, module: ModuleId) -> Self {
        let tokens = creature
            .servos_for(module)
            .map(|servo| {
                if servo.motor == MotorType::Dynamixel {
                    format!("D{} {} {}", servo.pin, servo.min_ticks, servo.max_ticks)
                } else {
                    format!("{} {} {}", servo.pin, servo.min_ticks, servo.max_ticks)
                }
            })
            .collect();
        ServoModuleConfiguration { tokens }
    }

    pub fn to_message(&self) -> String {
        let mut message = format!("CONFIG\t{}", self.tokens.len());
        for token in &self.tokens {
            message.push('\t');
            message.push_str(token);
        }
        message
    }

    pub fn to_message_with_checksum(&self) -> String {
        checksum::append(&self.to_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ModuleId, MotorType, ServoRef};

    fn servo(module: ModuleId, pin: u16, motor: MotorType, ticks: u32) -> ServoPosition {
        ServoPosition {
            servo: ServoRef { module, pin, motor },
            ticks,
        }
    }

    #[test]
    fn pos_encodes_pins_in_insertion_order() {
        let mut command = PositionCommand::new();
        command.add(servo(ModuleId::A, 0, MotorType::Servo, 123)).unwrap();
        command.add(servo(ModuleId::A, 1, MotorType::Servo, 456)).unwrap();
        command.add(servo(ModuleId::A, 4, MotorType::Servo, 789)).unwrap();
        command.add(servo(ModuleId::A, 5, MotorType::Servo, 10)).unwrap();
        assert_eq!(command.to_message(), "POS\t0 123\t1 456\t4 789\t5 10");
    }

    #[test]
    fn pos_prefixes_dynamixel_pins() {
        let mut command = PositionCommand::new();
        command.add(servo(ModuleId::A, 3, MotorType::Servo, 2048)).unwrap();
        command.add(servo(ModuleId::A, 4, MotorType::Dynamixel, 8100)).unwrap();
        assert_eq!(command.to_message(), "POS\t3 2048\tD4 8100");
    }

    #[test]
    fn pos_round_trip_wire_line() {
        // The exact wire bytes the firmware parser sees.
        let mut command = PositionCommand::new();
        command.add(servo(ModuleId::A, 3, MotorType::Servo, 2048)).unwrap();
        command.add(servo(ModuleId::A, 4, MotorType::Dynamixel, 8100)).unwrap();
        let line = command.to_message_with_checksum();
        let expected = checksum::sum("POS\t3 2048\tD4 8100\t");
        assert_eq!(line, format!("POS\t3 2048\tD4 8100\tCS {expected}"));
        assert!(checksum::verify(&line));
    }

    #[test]
    fn pos_rejects_duplicate_refs() {
        let mut command = PositionCommand::new();
        command.add(servo(ModuleId::A, 3, MotorType::Servo, 100)).unwrap();
        let err = command.add(servo(ModuleId::A, 3, MotorType::Servo, 200));
        assert!(matches!(err, Err(ControllerError::InvalidArgument(_))));
        // Same pin on a different module is a different actuator.
        command.add(servo(ModuleId::B, 3, MotorType::Servo, 200)).unwrap();
        assert_eq!(command.len(), 2);
    }

    #[test]
    fn empty_pos_encodes_to_nothing() {
        let command = PositionCommand::new();
        assert_eq!(command.to_message(), "");
        assert_eq!(command.to_message_with_checksum(), "");
    }

    #[test]
    fn estop_wire_form() {
        assert_eq!(emergency_stop(), "ESTOP\t1");
        let line = emergency_stop_with_checksum();
        assert!(line.starts_with("ESTOP\t1\tCS "));
        assert!(checksum::verify(&line));
    }

    #[test]
    fn ping_carries_epoch_seconds() {
        assert_eq!(ping(1700000000), "PING\t1700000000");
        assert!(checksum::verify(&ping_with_checksum(1700000000)));
    }

    #[test]
    fn flush_is_a_single_bell_byte_and_deterministic() {
        assert_eq!(FLUSH.as_bytes(), &[0x07]);
        assert_eq!(FLUSH, FLUSH);
    }
}
