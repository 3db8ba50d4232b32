// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `INIT\t<firmware_version>`: the firmware checked in and wants its
//! configuration.

use creature_common::{ControllerError, Result};
use creature_common::wire;
use tracing::info;

use crate::module::ModuleCore;

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    if tokens.len() != 2 {
        return Err(ControllerError::UnprocessableMessage(format!(
            "INIT message needs 2 tokens, got {}",
            tokens.len()
        )));
    }
    let firmware_version = wire::to_u32(tokens[1]);
    info!(module = %core.module(), firmware_version, "firmware checked in, wants configuration");
    core.firmware_ready_for_initialization(firmware_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::core_fixture;
    use crate::protocol::{HandlerState, ModuleId, EXPECTED_FIRMWARE_VERSION};

    #[test]
    fn matching_version_moves_to_configuring() {
        let mut fixture = core_fixture();
        fixture.handler.init().unwrap();
        let version = EXPECTED_FIRMWARE_VERSION.to_string();
        handle(&fixture, &["INIT", &version]).unwrap();
        assert_eq!(
            fixture.router.state_of(ModuleId::A),
            Some(HandlerState::Configuring)
        );
    }

    #[test]
    fn mismatched_version_is_fatal() {
        let mut fixture = core_fixture();
        fixture.handler.init().unwrap();
        let version = (EXPECTED_FIRMWARE_VERSION + 7).to_string();
        assert!(matches!(
            handle(&fixture, &["INIT", &version]),
            Err(ControllerError::InvalidConfiguration(_))
        ));
        assert_eq!(
            fixture.router.state_of(ModuleId::A),
            Some(HandlerState::AwaitingConfiguration)
        );
    }

    #[test]
    fn wrong_token_count_is_unprocessable() {
        let fixture = core_fixture();
        assert!(matches!(
            handle(&fixture, &["INIT"]),
            Err(ControllerError::UnprocessableMessage(_))
        ));
        assert!(matches!(
            handle(&fixture, &["INIT", "3", "extra"]),
            Err(ControllerError::UnprocessableMessage(_))
        ));
    }
}
