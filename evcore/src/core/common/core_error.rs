// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words osevent errno

use super::ErrorCode;
use crate::StoreError;
use miette::Diagnostic;

/// The error type of every fallible call in this crate.
///
/// Each variant maps onto one [`ErrorCode`] via [`code()`], which is what slow operations
/// hand to their completion callbacks. Recoverable failures are logged where they happen
/// and then returned as one of these; the state of whatever was being set up has been
/// rolled back to Idle by the time the caller sees it.
///
/// [`code()`]: Self::code
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum CoreError {
    #[error("{context}")]
    #[diagnostic(
        code(gmctl_evcore::os),
        help("A system call failed. The source error carries the errno")
    )]
    Os {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("application event loop refused to register {what}")]
    #[diagnostic(
        code(gmctl_evcore::osevent_reg_fail),
        help("An OsEventHooks implementation returned an error from a register call")
    )]
    OseventRegFail {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("timed out: {what}")]
    #[diagnostic(code(gmctl_evcore::timed_out))]
    TimedOut { what: String },

    #[error("invalid argument or vanished resource: {what}")]
    #[diagnostic(code(gmctl_evcore::inval))]
    Invalid { what: String },

    #[error("slow operation failed with {code} (rc={rc})", rc = .code.rc())]
    #[diagnostic(code(gmctl_evcore::ao_failed))]
    Operation { code: ErrorCode },

    #[error("pid {pid} is not a child of this context")]
    #[diagnostic(
        code(gmctl_evcore::unknown_child),
        help("Only pids created by EvChild::fork can be passed to childproc_reaped")
    )]
    UnknownChild { pid: i32 },

    #[error("context is poisoned by an earlier event-loop disaster")]
    #[diagnostic(
        code(gmctl_evcore::poisoned),
        help("Check the log for the DISASTER entry; create a fresh Ctx")
    )]
    Poisoned,
}

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Os { .. } | CoreError::Store(_) | CoreError::Poisoned => {
                ErrorCode::Fail
            }
            CoreError::OseventRegFail { .. } => ErrorCode::OseventRegFail,
            CoreError::TimedOut { .. } => ErrorCode::TimedOut,
            CoreError::Invalid { .. } | CoreError::UnknownChild { .. } => {
                ErrorCode::Inval
            }
            CoreError::Operation { code } => *code,
        }
    }

    /// Wraps an [`std::io::Error`] with a short description of what was being done.
    pub fn os(context: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::Os {
            context: context.into(),
            source,
        }
    }

    /// Same as [`os()`](Self::os) for an errno coming from `nix` or `rustix`.
    pub fn errno(context: impl Into<String>, errno: i32) -> Self {
        Self::os(context, std::io::Error::from_raw_os_error(errno))
    }
}

impl From<ErrorCode> for CoreError {
    fn from(code: ErrorCode) -> Self { CoreError::Operation { code } }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_follow_the_taxonomy() {
        let it = CoreError::os("pipe", std::io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(it.code(), ErrorCode::Fail);

        let it = CoreError::TimedOut {
            what: "dm".into(),
        };
        assert_eq!(it.code(), ErrorCode::TimedOut);

        let it = CoreError::from(ErrorCode::GuestTimedout);
        assert_eq!(it.code(), ErrorCode::GuestTimedout);
        assert!(it.to_string().contains("rc=-8"));

        assert_eq!(CoreError::Poisoned.code(), ErrorCode::Fail);
        assert_eq!(CoreError::UnknownChild { pid: 7 }.code(), ErrorCode::Inval);
    }
}
