// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `BSENSE`: board-level temperature and power telemetry.
//!
//! Wire shape, one token per field group:
//!
//! ```text
//! BSENSE\tTEMP <f>\tVBUS <v> <i> <p>\tMP_IN <v> <i> <p>\t3V3 <v> <i> <p>\t5V <v> <i> <p>
//! ```
//!
//! The report goes upstream as a `board-sensor-report`; the board
//! temperature and the summed rail power feed the watchdog's telemetry
//! scalars.

use creature_common::wire;
use creature_common::{ControllerError, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::module::ModuleCore;
use crate::server::OutboundNotice;
use crate::telemetry::telemetry;

fn rail_name(wire_name: &str) -> Option<&'static str> {
    match wire_name {
        "VBUS" => Some("vbus"),
        "MP_IN" => Some("motor_power_in"),
        "3V3" => Some("3v3"),
        "5V" => Some("5v"),
        _ => None,
    }
}

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    if tokens.len() < 6 {
        return Err(ControllerError::UnprocessableMessage(format!(
            "BSENSE message needs 6 tokens, got {}",
            tokens.len()
        )));
    }

    let temperature_fields = wire::fields(tokens[1]);
    if temperature_fields.len() != 2 || temperature_fields[0] != "TEMP" {
        warn!(token = tokens[1], "malformed BSENSE temperature token");
        return Ok(());
    }
    let board_temperature = wire::to_f64(temperature_fields[1]);
    if board_temperature.is_nan() {
        warn!(token = tokens[1], "unparseable board temperature");
        return Ok(());
    }
    info!(module = %core.module(), "chassis temperature: {board_temperature:.2}F");

    let mut payload = json!({ "board_temperature": board_temperature });
    let mut power_reports = Vec::new();
    let mut total_power = 0.0;

    for &token in &tokens[2..6] {
        let fields = wire::fields(token);
        if fields.len() != 4 {
            warn!(token, "expected four fields in a power rail token");
            continue;
        }
        let Some(name) = rail_name(fields[0]) else {
            warn!(rail = fields[0], "unknown power rail");
            continue;
        };
        let voltage = wire::to_f64(fields[1]);
        let current = wire::to_f64(fields[2]);
        let power = wire::to_f64(fields[3]);

        power_reports.push(json!({
            "name": name,
            "voltage": voltage,
            "current": current,
            "power": power,
        }));
        if !power.is_nan() {
            total_power += power;
        }
        info!(
            module = %core.module(),
            "rail {name}: {voltage:.2}V {current:.2}A {power:.2}W"
        );
    }
    payload["power_reports"] = power_reports.into();

    telemetry().set_board_temp_f(board_temperature);
    telemetry().set_power_w(total_power);

    core.server()
        .publish(OutboundNotice::BoardSensorReport(payload));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::core_fixture;

    const REPORT: &[&str] = &[
        "BSENSE",
        "TEMP 98.20",
        "VBUS 5.01 0.42 2.10",
        "MP_IN 12.02 1.50 18.03",
        "3V3 3.30 0.30 0.99",
        "5V 5.00 0.20 1.00",
    ];

    #[test]
    fn report_updates_telemetry_and_publishes_upstream() {
        let _scalars = crate::telemetry::testing::lock();
        let fixture = core_fixture();
        telemetry().reset();

        handle(&fixture, REPORT).unwrap();

        assert_eq!(telemetry().board_temp_f(), 98.2);
        // Sum of all four rails.
        assert!((telemetry().power_w() - 22.12).abs() < 1e-9);
        assert_eq!(fixture.server_queue.len(), 1);
    }

    #[test]
    fn report_payload_carries_all_rails() {
        let fixture = core_fixture();
        handle(&fixture, REPORT).unwrap();
        let notice = fixture.server_queue.pop().unwrap();
        assert_eq!(notice.command_tag(), "board-sensor-report");
        let payload = notice.payload();
        assert_eq!(payload["board_temperature"], 98.2);
        let rails = payload["power_reports"].as_array().unwrap();
        assert_eq!(rails.len(), 4);
        assert_eq!(rails[0]["name"], "vbus");
        assert_eq!(rails[1]["name"], "motor_power_in");
    }

    #[test]
    fn too_few_tokens_is_unprocessable() {
        let fixture = core_fixture();
        assert!(matches!(
            handle(&fixture, &["BSENSE", "TEMP 98.2"]),
            Err(ControllerError::UnprocessableMessage(_))
        ));
    }

    #[test]
    fn malformed_temperature_leaves_telemetry_alone() {
        let _scalars = crate::telemetry::testing::lock();
        let fixture = core_fixture();
        telemetry().reset();
        handle(
            &fixture,
            &[
                "BSENSE",
                "TEMP",
                "VBUS 5 1 5",
                "MP_IN 12 1 12",
                "3V3 3.3 1 3.3",
                "5V 5 1 5",
            ],
        )
        .unwrap();
        assert_eq!(telemetry().board_temp_f(), 0.0);
        assert_eq!(fixture.server_queue.len(), 0);
    }

    #[test]
    fn unknown_rail_is_skipped_not_fatal() {
        let _scalars = crate::telemetry::testing::lock();
        let fixture = core_fixture();
        telemetry().reset();
        handle(
            &fixture,
            &[
                "BSENSE",
                "TEMP 75.0",
                "MYSTERY 1 1 1",
                "MP_IN 12 1 12",
                "3V3 3.3 1 3.3",
                "5V 5 1 5",
            ],
        )
        .unwrap();
        // Only the three known rails contribute.
        assert!((telemetry().power_w() - 20.3).abs() < 1e-9);
    }
}
