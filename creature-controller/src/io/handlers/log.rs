// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `LOG\t<time>\t<level>\t<message>`: the firmware's log lines, re-emitted
//! through our own subscriber at the mapped severity.

use creature_common::{ControllerError, Result};
use tracing::{debug, error, info, trace, warn};

use crate::module::ModuleCore;

pub fn handle(core: &ModuleCore, tokens: &[&str]) -> Result<()> {
    if tokens.len() < 4 {
        return Err(ControllerError::UnprocessableMessage(format!(
            "LOG message needs 4 tokens, got {}",
            tokens.len()
        )));
    }
    let module = core.module();
    let level = tokens[2];
    let message = tokens[3];
    match level {
        "[V]" => trace!(%module, "{message}"),
        "[D]" => debug!(%module, "{message}"),
        "[I]" => info!(%module, "{message}"),
        "[W]" => warn!(%module, "{message}"),
        "[E]" => error!(%module, "{message}"),
        "[F]" => error!(%module, fatal = true, "{message}"),
        unknown => warn!(%module, "unknown firmware log level {unknown}: {message}"),
    }
    Ok(())
}
