// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc inprogress

//! Async operations.
//!
//! A slow operation is an [`Ao`]. Its initiating call wraps it in an [`AoOp`], sets up
//! whatever event sources it needs, and calls [`AoOp::inprogress()`]. Later, one of
//! those sources' callbacks calls [`Ao::complete()`], and the caller is told through
//! whichever [`AsyncopHow`] it picked: a callback, an event, or (with none) by the
//! initiating call itself blocking until then.
//!
//! Progress reports ([`Ao::progress_report()`]) go out as [`AsyncprogressHow`] says.
//! An operation is not reported complete, nor destroyed, while any of its progress
//! reports are still waiting to be delivered.

// Attach sources.
pub mod ao_impl;
pub mod ao_op;
pub mod ao_progress;

#[cfg(test)]
mod tests;

// Re-export.
pub use ao_impl::*;
pub use ao_op::*;
pub use ao_progress::*;
