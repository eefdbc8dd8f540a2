// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drizzle Protocol - pipe framing between a node and its worker processes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   fd 3: RequestFrame + "littledrizzle"   ┌──────────────────┐
//! │     drizzle-node     │ ───────────────────────────────────────▶ │  worker process  │
//! │   (Instance tasks)   │ ◀─────────────────────────────────────── │ (function code)  │
//! └──────────────────────┘   fd 4: ResponseFrame + "littledrizzle"  └──────────────────┘
//! ```
//!
//! - [`frame`]: delimiter codec ([`FrameReader`], [`FrameWriter`])
//! - [`message`]: pipe frames and the HTTP request/response bodies
//! - [`worker`]: worker-side serve loop

pub mod frame;
pub mod message;
pub mod worker;

pub use frame::{DELIMITER, FrameError, FrameReader, FrameWriter, encode, write_frame};
pub use message::{READY_ID, RequestFrame, ResponseFrame, WorkflowRequest, WorkflowResponse};
