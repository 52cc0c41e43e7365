// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// Attach sources.
pub mod constants;
pub mod core_error;
pub mod error_code;
pub mod miette_setup_global_report_handler;

// Re-export.
pub use constants::*;
pub use core_error::*;
pub use error_code::*;
pub use miette_setup_global_report_handler::*;
