// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Leaf building blocks shared by every other module: the shared context and its lock,
//! the allocation pool, the carefd guard, error types, and logging setup.

// Attach sources.
pub mod carefd;
pub mod common;
pub mod ctx;
pub mod log;
pub mod pool;

#[cfg(test)]
pub mod test_fixtures;

// Re-export. The carefd free functions stay namespaced, eg `carefd::begin()`.
pub use carefd::{Carefd, CarefdBracket};
pub use common::*;
pub use ctx::*;
pub use log::*;
pub use pool::*;
