// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc carefd datacopier sigchld osevent devstate

//! # gmctl_evcore
//!
//! The asynchronous-operation and event-dispatch core that guest-management operations
//! are built on. Slow management actions (starting a guest, hot-plugging a device,
//! waiting for a configuration-store path, spawning a helper daemon) run as an [`Ao`]
//! that completes later, while notifications reach the embedding application through
//! its own event loop.
//!
//! # Layers
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ slow operations: await_path_state, spawn, datacopier           │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Ao (AoOp create / inprogress / abort, complete, progress)      │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Egc (per-entry event batch, delivered unlocked)                │
//! ├────────────────────────────────────────────────────────────────┤
//! │ EvFd  EvTime  EvWatch  EvChild      Poller / OsEventHooks      │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Ctx (one recursive lock)   Pool   carefd   ConfigStore         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking rules
//!
//! There is exactly one lock, owned by the [`Ctx`], and it is recursive. Event source
//! callbacks run with it held. Application callbacks (operation completion, event
//! hooks, progress reports) run with it released, because they may call back into the
//! library. The [`Egc`] is the object that carries work from the first world into the
//! second.
//!
//! [`Ao`]: crate::Ao
//! [`Ctx`]: crate::Ctx
//! [`Egc`]: crate::Egc

// Enforce strict error handling in production library code only. Tests are allowed to
// use .unwrap() (workspace `Cargo.toml` config allows it).
#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach modules (re-exported below to provide clean public API).
pub mod ao;
pub mod core;
pub mod datacopier;
pub mod devstate;
pub mod event;
pub mod spawn;
pub mod store;

// Re-export stable public API using glob imports for ergonomic, flat API surface.
#[allow(ambiguous_glob_reexports)]
pub use ao::*;
#[allow(ambiguous_glob_reexports)]
pub use core::*;
pub use datacopier::*;
pub use devstate::*;
#[allow(ambiguous_glob_reexports)]
pub use event::*;
pub use spawn::*;
pub use store::*;
