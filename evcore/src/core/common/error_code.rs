// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The fixed taxonomy of result codes that slow operations report. Every code is a small
//! negative integer, and `0` means success. See [`ErrorCode`] and [`AoResult`].

use strum_macros::{AsRefStr, Display, EnumIter};

/// Result codes, as delivered to completion callbacks and carried by
/// [`CoreError::code()`].
///
/// [`CoreError::code()`]: crate::CoreError::code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[repr(i32)]
pub enum ErrorCode {
    NonSpecific = -1,
    Version = -2,
    Fail = -3,
    Ni = -4,
    NoMem = -5,
    /// Invalid argument, or a resource that vanished while being waited on.
    Inval = -6,
    BadFail = -7,
    GuestTimedout = -8,
    TimedOut = -9,
    NoParavirt = -10,
    NotReady = -11,
    /// The application's event-loop hooks refused a registration.
    OseventRegFail = -12,
    BufferFull = -13,
}

/// What a slow operation finally reports. `Ok(())` is rc `0`.
pub type AoResult = Result<(), ErrorCode>;

impl ErrorCode {
    #[must_use]
    pub fn rc(self) -> i32 { self as i32 }

    /// Maps an rc back to a code. `0` and unknown values return [`None`].
    #[must_use]
    pub fn from_rc(rc: i32) -> Option<Self> {
        use strum::IntoEnumIterator as _;
        Self::iter().find(|it| it.rc() == rc)
    }
}

/// Flattens an [`AoResult`] into the integer form used on the wire to applications.
#[must_use]
pub fn rc_of(result: AoResult) -> i32 {
    match result {
        Ok(()) => 0,
        Err(code) => code.rc(),
    }
}

/// Inverse of [`rc_of`]. Unknown negative values become [`ErrorCode::NonSpecific`].
#[must_use]
pub fn result_of_rc(rc: i32) -> AoResult {
    if rc == 0 {
        Ok(())
    } else {
        Err(ErrorCode::from_rc(rc).unwrap_or(ErrorCode::NonSpecific))
    }
}
