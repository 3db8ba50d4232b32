// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serial transport and message routing.

pub mod handlers;
pub mod processor;
pub mod router;
pub mod serial;
