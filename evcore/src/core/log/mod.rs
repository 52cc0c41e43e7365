// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Logging setup for applications and tests that embed this crate. The library itself
//! only emits `tracing` events; nothing is installed unless a [`TracingConfig`] is passed
//! in through [`CtxConfig`] or installed explicitly.
//!
//! [`CtxConfig`]: crate::CtxConfig

// Attach sources.
pub mod tracing_config;
pub mod tracing_init;

// Re-export.
pub use tracing_config::*;
pub use tracing_init::*;
