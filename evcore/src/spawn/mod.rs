// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Starting helper daemons: the double-fork [`SpawnState`] machine, and [`exec()`] for
//! the forked side.

// Attach sources.
pub mod exec;
pub mod spawn_state;

// Re-export.
pub use exec::*;
pub use spawn_state::*;
