// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the creature controller.
//!
//! Everything in here is small and free of policy: a FIFO
//! mailbox with shutdown signalling, a named stoppable worker thread, the
//! forgiving number parsers used on wire text, and the error type shared
//! across the controller's component boundaries.

pub mod error;
pub mod mailbox;
pub mod wire;
pub mod worker;

pub use error::{ControllerError, Result};
pub use mailbox::Mailbox;
pub use worker::{StopFlag, Worker};
