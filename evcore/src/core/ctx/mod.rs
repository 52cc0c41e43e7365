// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Attach sources.
pub mod ctx_config;
pub mod ctx_impl;

// Re-export.
pub use ctx_config::*;
pub use ctx_impl::*;
