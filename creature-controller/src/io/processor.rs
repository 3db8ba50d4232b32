// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound message dispatch.
//!
//! Frames are split on TAB; the first token selects a handler. A handler
//! validates its own token count and field shapes. Unknown tags are an
//! error the caller logs and drops; they never take the processor down.

use creature_common::{ControllerError, Result};

use crate::io::handlers;
use crate::module::ModuleCore;

/// Dispatches one inbound payload to its handler.
pub fn dispatch(core: &ModuleCore, payload: &str) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    let tokens: Vec<&str> = payload.split('\t').collect();
    match tokens[0] {
        "LOG" => handlers::log::handle(core, &tokens),
        "STATS" => handlers::stats::handle(core, &tokens),
        "PONG" => handlers::pong::handle(core, &tokens),
        "INIT" => handlers::init::handle(core, &tokens),
        "READY" => handlers::ready::handle(core, &tokens),
        "BSENSE" => handlers::board_sensor::handle(core, &tokens),
        "MSENSE" => handlers::motor_sensor::handle(core, &tokens),
        "DSENSE" => handlers::dynamixel_sensor::handle(core, &tokens),
        unknown => Err(ControllerError::UnprocessableMessage(format!(
            "unknown message type: {unknown}"
        ))),
    }
}
