// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `STATS …`: free-form diagnostic breadcrumbs from the firmware. Logged,
//! nothing more.

use creature_common::Result;
use tracing::debug;

use crate::module::ModuleCore;

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    debug!(module = %core.module(), stats = ?&tokens[1..], "firmware stats");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::core_fixture;

    #[test]
    fn any_shape_is_accepted() {
        let fixture = core_fixture();
        handle(&fixture, &["STATS"]).unwrap();
        handle(&fixture, &["STATS", "heap 1234", "uptime 99"]).unwrap();
    }
}
