// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Installs a graphical [miette](https://docs.rs/miette/latest/miette/index.html) report
//! handler for binaries that embed this crate and return `miette::Result` from `main()`.
//!
//! The [`miette::ErrorHook`] is lazily evaluated, so the width is only computed when a
//! report is actually rendered.

use miette::MietteHandlerOpts;
use tracing::debug;

const DEFAULT_REPORT_WIDTH: usize = 80;

/// Reads the `COLUMNS` environment variable, falling back to 80 columns. Management
/// tools often run without a controlling terminal, so there is no ioctl here.
fn report_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|it| it.trim().parse::<usize>().ok())
        .filter(|it| *it > 0)
        .unwrap_or(DEFAULT_REPORT_WIDTH)
}

pub fn setup_default_miette_global_report_handler(issues_url: &'static str) {
    miette::set_hook(Box::new(|_report| {
        let width = report_width();
        debug!("miette::set_hook -> width: {}", width);
        Box::new(
            MietteHandlerOpts::new()
                .width(width)
                .wrap_lines(true)
                .unicode(true)
                .context_lines(3)
                .tab_width(4)
                .with_cause_chain()
                .footer(issues_url.to_string())
                .build(),
        )
    }))
    .ok();
}
