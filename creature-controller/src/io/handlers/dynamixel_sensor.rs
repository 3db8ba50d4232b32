// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `DSENSE`: Dynamixel chain telemetry.
//!
//! Wire shape: `DSENSE\tD<id> <temp_f> <load> <voltage_mV>\t…`, one token
//! per motor on the chain. `load` is signed (direction) in tenths of a
//! percent; the watchdog only cares about its magnitude. The hottest and
//! hardest-working motor of each report feed the telemetry scalars.

use creature_common::wire;
use creature_common::{ControllerError, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::module::ModuleCore;
use crate::server::OutboundNotice;
use crate::telemetry::telemetry;

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    if tokens.len() < 2 {
        return Err(ControllerError::UnprocessableMessage(
            "DSENSE message has no motor tokens".to_string(),
        ));
    }

    let mut motors = Vec::new();
    let mut max_temperature = f64::NEG_INFINITY;
    let mut max_load_tenths = f64::NEG_INFINITY;

    for &token in &tokens[1..] {
        let fields = wire::fields(token);
        if fields.len() != 4 {
            warn!(token, "expected four fields in a DSENSE motor token");
            continue;
        }
        let Some(id_digits) = fields[0].strip_prefix('D') else {
            warn!(token = fields[0], "DSENSE motor token missing D prefix");
            continue;
        };
        let motor_id = wire::to_u32(id_digits);
        let temperature_f = wire::to_f64(fields[1]);
        // Present load is the one signed field on this wire.
        let present_load = wire::to_i32(fields[2]);
        let voltage_mv = wire::to_u32(fields[3]);
        let voltage_v = f64::from(voltage_mv) / 1000.0;

        motors.push(json!({
            "dxl_id": motor_id,
            "temperature_f": temperature_f,
            "present_load": present_load,
            "voltage_mv": voltage_mv,
            "voltage_v": voltage_v,
        }));

        if !temperature_f.is_nan() {
            max_temperature = max_temperature.max(temperature_f);
        }
        max_load_tenths = max_load_tenths.max(f64::from(present_load.unsigned_abs()));

        info!(
            module = %core.module(),
            "dynamixel {motor_id}: {temperature_f:.1}F, load {present_load}, {voltage_v:.2}V"
        );
    }

    if motors.is_empty() {
        warn!(module = %core.module(), "DSENSE report had no parseable motors");
        return Ok(());
    }

    if max_temperature.is_finite() {
        telemetry().set_dxl_temp_f(max_temperature);
    }
    if max_load_tenths.is_finite() {
        telemetry().set_dxl_load_tenths_percent(max_load_tenths);
    }

    core.server().publish(OutboundNotice::DynamixelSensorReport(json!({
        "dynamixel_motors": motors,
    })));
    Ok(())
}
