// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker launchers.
//!
//! A launcher turns a function name into a running worker with two pipe ends
//! attached. The instance layer never cares whether the worker is a real
//! process or an in-process task.

pub mod mock;
pub mod process;
mod traits;

pub use mock::MockLauncher;
pub use process::{ProcessLauncher, ProcessLauncherConfig};
pub use traits::*;
