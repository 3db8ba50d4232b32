// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `READY`: the firmware finished configuring and can take motion
//! commands.

use creature_common::Result;
use tracing::info;

use crate::module::ModuleCore;

pub fn handle(core: &ModuleCore, _tokens: &[&str]) -> Result<()> {
    info!(module = %core.module(), "READY received from firmware");
    core.firmware_ready_to_operate();
    Ok(())
}
