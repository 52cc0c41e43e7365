// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Non-blocking fd-to-fd copying driven by the event loop.

// Attach sources.
pub mod datacopier_end;
pub mod datacopier_impl;

// Re-export.
pub use datacopier_end::*;
pub use datacopier_impl::*;
