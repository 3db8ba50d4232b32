// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Error type shared across the controller's component boundaries.
///
/// Per-frame problems (`UnprocessableMessage`) are logged and recovered
/// locally; `Transport` and `InvalidConfiguration` escalate to the owning
/// subsystem, which stops cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Startup configuration is unusable (missing device, duplicate module
    /// id, firmware version mismatch, …). Fatal to the process.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A frame was addressed to a module nobody registered.
    #[error("unknown destination module: {0}")]
    DestinationUnknown(String),

    /// An inbound frame could not be handled (unknown tag, missing tokens).
    #[error("unprocessable message: {0}")]
    UnprocessableMessage(String),

    /// A motion command was submitted to a module that is not in the Ready
    /// state.
    #[error("module not ready: {0}")]
    NotReady(String),

    /// A caller handed us something we refuse to encode (duplicate servo
    /// refs and the like).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The serial device or a socket failed underneath us.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A blocking primitive observed the shutdown signal.
    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<crate::mailbox::MailboxClosed> for ControllerError {
    fn from(_: crate::mailbox::MailboxClosed) -> Self {
        ControllerError::ShuttingDown
    }
}
