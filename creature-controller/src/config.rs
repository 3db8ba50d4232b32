// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command line and creature configuration.
//!
//! The creature file is the single source of truth for everything the show
//! server does not send at runtime: which modules exist and where their
//! serial devices live, per-servo calibration, the audio channel, and the
//! watchdog safety envelopes.

use clap::Parser;
use creature_common::{ControllerError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::protocol::{ModuleId, MotorType};

/// Command line surface. Everything else comes from the creature file.
#[derive(Debug, Parser)]
#[command(name = "creature-controller", about = "Controller for one creature")]
pub struct CommandLine {
    /// JSON file describing this creature
    #[arg(short = 'c', long = "creature-config")]
    pub creature_config: PathBuf,

    /// Serial device for the creature's default module
    #[arg(short = 'u', long = "usb-device", default_value = "/dev/tty.usbmodem101")]
    pub usb_device: String,
}

/// One UART link to a motor module.
#[derive(Debug, Clone, Deserialize)]
pub struct UartDeviceConfig {
    pub module: ModuleId,
    pub device_node: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Calibration and limits for one actuator.
#[derive(Debug, Clone, Deserialize)]
pub struct ServoConfig {
    pub module: ModuleId,
    pub pin: u16,
    #[serde(rename = "type")]
    pub motor: MotorType,
    pub min_ticks: u32,
    pub max_ticks: u32,
}

/// The four safety envelopes: a warning threshold, a hard limit, and the
/// dwell time a breach must persist before the emergency stop fires.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogThresholds {
    #[serde(default = "default_power_warning")]
    pub power_draw_warning_watts: f64,
    #[serde(default = "default_power_limit")]
    pub power_draw_limit_watts: f64,
    #[serde(default = "default_dwell_seconds")]
    pub power_draw_response_seconds: f64,

    #[serde(default = "default_temp_warning")]
    pub temperature_warning_degrees: f64,
    #[serde(default = "default_temp_limit")]
    pub temperature_limit_degrees: f64,
    #[serde(default = "default_dwell_seconds")]
    pub temperature_limit_seconds: f64,

    #[serde(default = "default_dxl_temp_warning")]
    pub dynamixel_temperature_warning_degrees: f64,
    #[serde(default = "default_dxl_temp_limit")]
    pub dynamixel_temperature_limit_degrees: f64,
    #[serde(default = "default_dwell_seconds")]
    pub dynamixel_temperature_limit_seconds: f64,

    #[serde(default = "default_dxl_load_warning")]
    pub dynamixel_load_warning_percent: f64,
    #[serde(default = "default_dxl_load_limit")]
    pub dynamixel_load_limit_percent: f64,
    #[serde(default = "default_dwell_seconds")]
    pub dynamixel_load_limit_seconds: f64,
}

impl Default for WatchdogThresholds {
    fn default() -> Self {
        WatchdogThresholds {
            power_draw_warning_watts: default_power_warning(),
            power_draw_limit_watts: default_power_limit(),
            power_draw_response_seconds: default_dwell_seconds(),
            temperature_warning_degrees: default_temp_warning(),
            temperature_limit_degrees: default_temp_limit(),
            temperature_limit_seconds: default_dwell_seconds(),
            dynamixel_temperature_warning_degrees: default_dxl_temp_warning(),
            dynamixel_temperature_limit_degrees: default_dxl_temp_limit(),
            dynamixel_temperature_limit_seconds: default_dwell_seconds(),
            dynamixel_load_warning_percent: default_dxl_load_warning(),
            dynamixel_load_limit_percent: default_dxl_load_limit(),
            dynamixel_load_limit_seconds: default_dwell_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_power_warning() -> f64 {
    50.0
}
fn default_power_limit() -> f64 {
    60.0
}
fn default_temp_warning() -> f64 {
    140.0
}
fn default_temp_limit() -> f64 {
    180.0
}
fn default_dxl_temp_warning() -> f64 {
    130.0
}
fn default_dxl_temp_limit() -> f64 {
    150.0
}
fn default_dxl_load_warning() -> f64 {
    70.0
}
fn default_dxl_load_limit() -> f64 {
    85.0
}
fn default_dwell_seconds() -> f64 {
    2.0
}

fn default_rtp_port() -> u16 {
    crate::audio::RTP_PORT
}

fn default_interface_ip() -> String {
    "0.0.0.0".to_string()
}

/// The creature file.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatureConfig {
    /// Stable identifier used in every outbound server envelope.
    pub id: String,
    /// Dialog multicast channel, 1–16.
    pub audio_channel: u8,
    #[serde(default = "default_interface_ip")]
    pub interface_ip: String,
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,
    pub uart_devices: Vec<UartDeviceConfig>,
    #[serde(default)]
    pub servos: Vec<ServoConfig>,
    #[serde(default)]
    pub watchdog: WatchdogThresholds,
}

impl CreatureConfig {
    /// Loads and validates a creature file.
    pub fn load(path: &Path) -> Result<CreatureConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfiguration(format!(
                "cannot read creature file {}: {e}",
                path.display()
            ))
        })?;
        let config: CreatureConfig = serde_json::from_str(&text).map_err(|e| {
            ControllerError::InvalidConfiguration(format!(
                "cannot parse creature file {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ControllerError::InvalidConfiguration(
                "creature id must not be empty".to_string(),
            ));
        }
        if !(1..=16).contains(&self.audio_channel) {
            return Err(ControllerError::InvalidConfiguration(format!(
                "audio channel must be 1-16, got {}",
                self.audio_channel
            )));
        }
        let mut seen = HashSet::new();
        for device in &self.uart_devices {
            if device.device_node.is_empty() {
                return Err(ControllerError::InvalidConfiguration(format!(
                    "module {} has an empty device node",
                    device.module
                )));
            }
            if !seen.insert(device.module) {
                return Err(ControllerError::InvalidConfiguration(format!(
                    "module {} is configured twice",
                    device.module
                )));
            }
        }
        for servo in &self.servos {
            if servo.min_ticks > servo.max_ticks {
                return Err(ControllerError::InvalidConfiguration(format!(
                    "servo {}:{} has min_ticks {} > max_ticks {}",
                    servo.module, servo.pin, servo.min_ticks, servo.max_ticks
                )));
            }
        }
        Ok(())
    }

    /// The enabled UART links, in file order.
    pub fn enabled_uart_devices(&self) -> impl Iterator<Item = &UartDeviceConfig> {
        self.uart_devices.iter().filter(|d| d.enabled)
    }

    /// The servos attached to one module, in file order.
    pub fn servos_for(&self, module: ModuleId) -> impl Iterator<Item = &ServoConfig> {
        self.servos.iter().filter(move |s| s.module == module)
    }
}
