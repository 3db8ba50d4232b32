// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `PONG`: pairs with the last outbound `PING` and reports the round
//! trip.

use creature_common::Result;
use tracing::{info, warn};

use crate::module::ModuleCore;

pub fn handle(core: &ModuleCore, _tokens: &[&str]) -> Result<()> {
    let module = core.module();
    match core.ping_round_trip() {
        Some(round_trip) => {
            let micros = round_trip.as_micros();
            info!(%module, micros, "pong from firmware");
            core.send_to_controller(format!("pong from module {module} ({micros}us)"));
        }
        None => {
            warn!(%module, "PONG received with no outstanding PING");
        }
    }
    Ok(())
}
