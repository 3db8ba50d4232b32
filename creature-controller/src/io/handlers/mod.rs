// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Handlers for the messages a module sends us.
//!
//! Every handler follows the same contract: validate its own tokens, log
//! malformed input at warn severity, and return without touching telemetry
//! when it cannot parse. Recoverable per-frame failures are the norm here.

pub mod board_sensor;
pub mod dynamixel_sensor;
pub mod init;
pub mod log;
pub mod motor_sensor;
pub mod pong;
pub mod ready;
pub mod stats;
