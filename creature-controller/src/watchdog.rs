// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The safety watchdog.
//!
//! Four envelopes (total power draw, board temperature, Dynamixel
//! temperature, Dynamixel load) each pair a warning threshold with a hard
//! limit and a dwell time tolerance. Warnings go upstream once per excursion. A hard
//! limit held past its dwell triggers the emergency stop: a structured
//! notice to the server, a checksummed `ESTOP` to every registered module,
//! and then the watchdog retires; the system is in failsafe and there is
//! nothing left for it to do.

use creature_common::{ControllerError, Result, Worker};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::config::WatchdogThresholds;
use crate::io::router::MessageRouter;
use crate::protocol::commands::emergency_stop_with_checksum;
use crate::protocol::Frame;
use crate::server::{OutboundNotice, ServerHandle};
use crate::telemetry::telemetry;

/// Sampling cadence for every envelope.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// What one envelope check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeAction {
    /// Value is inside the envelope, or an excursion already reported.
    Nothing,
    /// Crossed the warning threshold; publish one warning.
    Warn,
    /// Held at or above the hard limit for the full dwell window.
    Estop,
}

/// One safety envelope with its excursion state.
#[derive(Debug)]
pub struct Envelope {
    label: &'static str,
    warning_type: &'static str,
    warning: f64,
    limit: f64,
    dwell: Duration,
    over_since: Option<Instant>,
    warn_logged: bool,
}

impl Envelope {
    pub fn new(
        label: &'static str,
        warning_type: &'static str,
        warning: f64,
        limit: f64,
        dwell: Duration,
    ) -> Envelope {
        Envelope {
            label,
            warning_type,
            warning,
            limit,
            dwell,
            over_since: None,
            warn_logged: false,
        }
    }

    pub fn warning_threshold(&self) -> f64 {
        self.warning
    }

    /// Runs one sampling step against `value` at time `now`.
    pub fn check(&mut self, value: f64, now: Instant) -> EnvelopeAction {
        if value >= self.limit {
            match self.over_since {
                None => {
                    self.over_since = Some(now);
                    warn!(
                        envelope = self.label,
                        value, limit = self.limit, "hard limit exceeded"
                    );
                    warn!(
                        envelope = self.label,
                        dwell_s = self.dwell.as_secs_f64(),
                        "emergency stop will trigger if the breach persists"
                    );
                }
                Some(since) if now.duration_since(since) >= self.dwell => {
                    return EnvelopeAction::Estop;
                }
                Some(_) => {}
            }
        } else if self.over_since.take().is_some() {
            info!(envelope = self.label, value, "returned to safe levels");
            self.warn_logged = false;
        }

        if value >= self.warning && !self.warn_logged {
            warn!(
                envelope = self.label,
                value, warning = self.warning, "warning threshold exceeded"
            );
            self.warn_logged = true;
            return EnvelopeAction::Warn;
        } else if value < self.warning {
            self.warn_logged = false;
        }
        EnvelopeAction::Nothing
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Publishes the estop notice and fans `ESTOP` out to every registered
/// module. Per-module failures are logged and the fanout continues;
/// nothing on this path waits for an answer.
pub fn trigger_emergency_stop(reason: &str, router: &MessageRouter, server: &ServerHandle) {
    error!("EMERGENCY STOP TRIGGERED: {reason}");

    server.publish(OutboundNotice::EmergencyStop(json!({
        "reason": reason,
        "timestamp": epoch_millis() as u64,
    })));

    let modules = router.ids();
    error!(count = modules.len(), "sending ESTOP to all modules");
    let message = emergency_stop_with_checksum();
    for module in modules {
        match router.send(Frame::new(module, message.clone())) {
            Ok(()) => error!(%module, "ESTOP sent"),
            Err(e) => error!(%module, %e, "failed to send ESTOP"),
        }
    }
}

pub struct Watchdog {
    thresholds: WatchdogThresholds,
    router: Arc<MessageRouter>,
    server: ServerHandle,
    tripped: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl Watchdog {
    pub fn new(
        thresholds: WatchdogThresholds,
        router: Arc<MessageRouter>,
        server: ServerHandle,
    ) -> Watchdog {
        Watchdog {
            thresholds,
            router,
            server,
            tripped: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Whether the emergency stop has fired.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn start(&mut self) -> Result<()> {
        let t = &self.thresholds;
        info!(
            power_limit = t.power_draw_limit_watts,
            power_warning = t.power_draw_warning_watts,
            temp_limit = t.temperature_limit_degrees,
            dxl_temp_limit = t.dynamixel_temperature_limit_degrees,
            dxl_load_limit = t.dynamixel_load_limit_percent,
            "watchdog starting"
        );
        let mut envelopes = [
            Envelope::new(
                "power draw",
                "power_draw_warning",
                t.power_draw_warning_watts,
                t.power_draw_limit_watts,
                Duration::from_secs_f64(t.power_draw_response_seconds),
            ),
            Envelope::new(
                "board temperature",
                "temperature_warning",
                t.temperature_warning_degrees,
                t.temperature_limit_degrees,
                Duration::from_secs_f64(t.temperature_limit_seconds),
            ),
            Envelope::new(
                "dynamixel temperature",
                "dynamixel_temperature_warning",
                t.dynamixel_temperature_warning_degrees,
                t.dynamixel_temperature_limit_degrees,
                Duration::from_secs_f64(t.dynamixel_temperature_limit_seconds),
            ),
            Envelope::new(
                "dynamixel load",
                "dynamixel_load_warning",
                t.dynamixel_load_warning_percent,
                t.dynamixel_load_limit_percent,
                Duration::from_secs_f64(t.dynamixel_load_limit_seconds),
            ),
        ];

        let router = Arc::clone(&self.router);
        let server = self.server.clone();
        let tripped = Arc::clone(&self.tripped);

        let worker = Worker::spawn("watchdog", move |stop| {
            info!("watchdog monitoring loop running");
            while !stop.is_set() {
                let scalars = telemetry();
                let samples = [
                    scalars.power_w(),
                    scalars.board_temp_f(),
                    scalars.dxl_temp_f(),
                    // Telemetry arrives in tenths of a percent.
                    scalars.dxl_load_tenths_percent() / 10.0,
                ];
                let now = Instant::now();
                let mut estop_reason = None;
                for (envelope, &value) in envelopes.iter_mut().zip(samples.iter()) {
                    match envelope.check(value, now) {
                        EnvelopeAction::Nothing => {}
                        EnvelopeAction::Warn => {
                            server.publish(OutboundNotice::WatchdogWarning(json!({
                                "warning_type": envelope.warning_type,
                                "current_value": value,
                                "threshold": envelope.warning_threshold(),
                                "timestamp": epoch_millis() as u64,
                            })));
                            debug!(warning = envelope.warning_type, "watchdog warning sent");
                        }
                        EnvelopeAction::Estop => {
                            estop_reason =
                                Some(format!("{} limit exceeded for too long", envelope.label));
                            break;
                        }
                    }
                }
                if let Some(reason) = estop_reason {
                    trigger_emergency_stop(&reason, &router, &server);
                    tripped.store(true, Ordering::Release);
                    // The watchdog has done its job; the system is in
                    // failsafe.
                    break;
                }
                std::thread::sleep(SAMPLE_INTERVAL);
            }
            info!("watchdog stopped");
        })
        .map_err(|e| ControllerError::Transport(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop(Duration::from_millis(500));
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
