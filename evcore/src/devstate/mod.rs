// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words devstate

//! Waiting for a store path to reach a state, as an event source ([`EvDevstate`]) and
//! as a slow operation ([`await_path_state()`]).

// Attach sources.
pub mod await_path_state;
pub mod ev_devstate;

// Re-export.
pub use await_path_state::*;
pub use ev_devstate::*;
