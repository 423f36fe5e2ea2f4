// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CRIU protocol driver.
//!
//! Speaks the swrk RPC protocol to a per-operation CRIU worker and routes
//! in-band notifications to a hook set.

mod driver;
mod hooks;
mod options;
pub(crate) mod session;

pub use driver::{Criu, CriuConnector};
pub use hooks::{Dispatch, HookContext, HookFn, HookName, HookSet};
pub use options::{CgroupMode, CheckpointOptions, InheritFd};
pub use session::{request_name, version_number, CriuFeatures, Session, RESPONSE_BUFFER_SIZE};
