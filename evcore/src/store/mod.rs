// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The configuration store, reached through the narrow synchronous [`ConfigStore`]
//! interface. [`MemStore`] is the in-process implementation.

// Attach sources.
pub mod config_store;
pub mod mem_store;

// Re-export.
pub use config_store::*;
pub use mem_store::*;
