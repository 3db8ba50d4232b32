// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-side controller for an animatronic creature.
//!
//! The controller bridges a show-control network to the microcontroller
//! modules that physically drive the creature's motors. Three subsystems do
//! the real work:
//!
//! - [`io`]: full-duplex framed messaging over one serial link per motor
//!   module, with per-module state tracking and a central message router.
//! - [`audio`]: two synchronized multicast Opus-over-RTP streams (dialog
//!   and background music), jitter-buffered, mixed, and queued to the local
//!   audio output.
//! - [`watchdog`]: the safety loop that samples telemetry and broadcasts an
//!   emergency stop when a limit stays breached past its dwell time.
//!
//! Everything else (configuration, command encoding, the outbound server
//! sink) exists to serve those three.

pub mod audio;
pub mod config;
pub mod io;
pub mod module;
pub mod protocol;
pub mod server;
pub mod telemetry;
pub mod watchdog;
