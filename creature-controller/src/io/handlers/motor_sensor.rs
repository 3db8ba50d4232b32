// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `MSENSE`: per-motor electrical telemetry for the eight PWM channels.
//!
//! Wire shape: `MSENSE\tM0 <pos> <v> <i> <p>\t…\tM7 <pos> <v> <i> <p>`.
//! Forwarded upstream as a `motor-sensor-report`; the watchdog does not
//! consume this one.

use creature_common::wire;
use creature_common::{ControllerError, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::module::ModuleCore;
use crate::server::OutboundNotice;

const MOTOR_COUNT: usize = 8;

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    if tokens.len() < 1 + MOTOR_COUNT {
        return Err(ControllerError::UnprocessableMessage(format!(
            "MSENSE message needs {} tokens, got {}",
            1 + MOTOR_COUNT,
            tokens.len()
        )));
    }

    let mut motors = Vec::with_capacity(MOTOR_COUNT);
    for (index, &token) in tokens[1..=MOTOR_COUNT].iter().enumerate() {
        let fields = wire::fields(token);
        if fields.len() != 5 {
            warn!(token, "expected five fields in a motor token");
            continue;
        }
        let position = wire::to_u32(fields[1]);
        let voltage = wire::to_f64(fields[2]);
        let current = wire::to_f64(fields[3]);
        let power = wire::to_f64(fields[4]);
        motors.push(json!({
            "number": index,
            "position": position,
            "voltage": voltage,
            "current": current,
            "power": power,
        }));
        info!(
            module = %core.module(),
            "motor {index}: position {position}, {voltage:.2}V {current:.2}A {power:.2}W"
        );
    }

    core.server()
        .publish(OutboundNotice::MotorSensorReport(json!({ "motors": motors })));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::core_fixture;

    fn full_report() -> Vec<String> {
        let mut tokens = vec!["MSENSE".to_string()];
        for m in 0..8 {
            tokens.push(format!("M{m} {} 5.0{m} 0.1{m} 0.5{m}", 1000 + m));
        }
        tokens
    }

    #[test]
    fn full_report_forwards_eight_motors() {
        let fixture = core_fixture();
        let owned = full_report();
        let tokens: Vec<&str> = owned.iter().map(String::as_str).collect();
        handle(&fixture, &tokens).unwrap();

        let notice = fixture.server_queue.pop().unwrap();
        assert_eq!(notice.command_tag(), "motor-sensor-report");
        let motors = notice.payload()["motors"].as_array().unwrap();
        assert_eq!(motors.len(), 8);
        assert_eq!(motors[3]["number"], 3);
        assert_eq!(motors[3]["position"], 1003);
    }

    #[test]
    fn short_report_is_unprocessable() {
        let fixture = core_fixture();
        assert!(matches!(
            handle(&fixture, &["MSENSE", "M0 1 2 3 4"]),
            Err(ControllerError::UnprocessableMessage(_))
        ));
        assert_eq!(fixture.server_queue.len(), 0);
    }

    #[test]
    fn malformed_motor_token_is_skipped() {
        let fixture = core_fixture();
        let mut owned = full_report();
        owned[2] = "M1 broken".to_string();
        let tokens: Vec<&str> = owned.iter().map(String::as_str).collect();
        handle(&fixture, &tokens).unwrap();

        let notice = fixture.server_queue.pop().unwrap();
        let motors = notice.payload()["motors"].as_array().unwrap();
        assert_eq!(motors.len(), 7);
    }
}
