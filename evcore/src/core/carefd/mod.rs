// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words carefd

// Attach sources.
pub mod carefd_impl;

// Re-export.
pub use carefd_impl::*;
