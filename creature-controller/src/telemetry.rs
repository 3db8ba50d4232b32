// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide telemetry scalars.
//!
//! There is exactly one instance per process: the inbound sensor
//! handlers write these and the watchdog reads them, nothing else. Values
//! are f64 bit patterns in atomics so both sides stay lock-free; teardown is
//! a no-op.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct TelemetryScalars {
    board_temp_f: AtomicU64,
    power_w: AtomicU64,
    dxl_temp_f: AtomicU64,
    dxl_load_tenths_percent: AtomicU64,
}

impl TelemetryScalars {
    const fn new() -> Self {
        TelemetryScalars {
            board_temp_f: AtomicU64::new(0),
            power_w: AtomicU64::new(0),
            dxl_temp_f: AtomicU64::new(0),
            dxl_load_tenths_percent: AtomicU64::new(0),
        }
    }

    pub fn set_board_temp_f(&self, degrees: f64) {
        self.board_temp_f.store(degrees.to_bits(), Ordering::Relaxed);
    }

    pub fn board_temp_f(&self) -> f64 {
        f64::from_bits(self.board_temp_f.load(Ordering::Relaxed))
    }

    pub fn set_power_w(&self, watts: f64) {
        self.power_w.store(watts.to_bits(), Ordering::Relaxed);
    }

    pub fn power_w(&self) -> f64 {
        f64::from_bits(self.power_w.load(Ordering::Relaxed))
    }

    pub fn set_dxl_temp_f(&self, degrees: f64) {
        self.dxl_temp_f.store(degrees.to_bits(), Ordering::Relaxed);
    }

    pub fn dxl_temp_f(&self) -> f64 {
        f64::from_bits(self.dxl_temp_f.load(Ordering::Relaxed))
    }

    /// Dynamixel load as reported by the firmware: tenths of a percent,
    /// already folded to a magnitude by the sensor handler.
    pub fn set_dxl_load_tenths_percent(&self, tenths: f64) {
        self.dxl_load_tenths_percent
            .store(tenths.to_bits(), Ordering::Relaxed);
    }

    pub fn dxl_load_tenths_percent(&self) -> f64 {
        f64::from_bits(self.dxl_load_tenths_percent.load(Ordering::Relaxed))
    }

    /// Test hook: drop everything back to zero.
    #[cfg(test)]
    pub fn reset(&self) {
        self.set_board_temp_f(0.0);
        self.set_power_w(0.0);
        self.set_dxl_temp_f(0.0);
        self.set_dxl_load_tenths_percent(0.0);
    }
}

static TELEMETRY: TelemetryScalars = TelemetryScalars::new();

/// The process-wide scalars.
pub fn telemetry() -> &'static TelemetryScalars {
    &TELEMETRY
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Mutex, MutexGuard};

    static TEST_GUARD: Mutex<()> = Mutex::new(());

    /// Tests that read or write the process-wide scalars hold this so they
    /// do not interleave under the parallel test runner.
    pub fn lock() -> MutexGuard<'static, ()> {
        match TEST_GUARD.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
