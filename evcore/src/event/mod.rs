// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc osevent

//! Event sources, the pollers that wait on them, and the machinery that carries results
//! out to the application.
//!
//! | Source       | Fires                                  | Ends                        |
//! | :----------- | :------------------------------------- | :-------------------------- |
//! | [`EvFd`]     | each time the fd is ready              | `deregister()`              |
//! | [`EvTime`]   | once, at its deadline                  | firing, or `deregister()`   |
//! | [`EvWatch`]  | each time the store path changes       | `deregister()`              |
//! | [`EvChild`]  | once, when the child is reaped         | firing                      |
//!
//! Source callbacks run with the [`Ctx`](crate::Ctx) lock held and get the current
//! [`Egc`]. Anything meant for the application is queued on that egc and delivered when
//! it is dropped, after the lock has been released.

// Attach sources.
pub mod egc;
pub mod ev_child;
pub mod ev_fd;
pub mod ev_ids;
pub mod ev_time;
pub mod ev_watch;
pub mod event_delivery;
pub mod event_types;
pub mod osevent_hooks;
pub mod poller;

// Re-export.
pub use egc::*;
pub use ev_child::*;
pub use ev_fd::*;
pub use ev_ids::*;
pub use ev_time::*;
pub use ev_watch::*;
pub use event_delivery::*;
pub use event_types::*;
pub use osevent_hooks::*;
pub use poller::*;
