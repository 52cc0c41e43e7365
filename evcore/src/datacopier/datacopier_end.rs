// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words errno errnoval onwrite

/// Why a [`Datacopier`](crate::Datacopier) stopped. Every outcome except
/// [`Eof`](Self::Eof) has been logged by the time the callback sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatacopierEnd {
    /// End of input, and everything read has been written.
    Eof,
    ReadError(i32),
    WriteError(i32),
    /// The mirror log couldn't be written.
    LogError(i32),
    Internal(DatacopierInternal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum DatacopierInternal {
    /// More than `maxsz` bytes were read.
    SizeExceeded,
    /// `poll(2)` reported an error condition on one of the fds.
    UnexpectedPollEvent,
    /// Re-arming an fd registration failed.
    Registration,
}

impl DatacopierEnd {
    /// `1` for a write failure, `0` for end of input or a read failure, `-1` for
    /// anything else.
    #[must_use]
    pub fn onwrite(self) -> i32 {
        match self {
            DatacopierEnd::WriteError(_) => 1,
            DatacopierEnd::Eof | DatacopierEnd::ReadError(_) => 0,
            DatacopierEnd::LogError(_) | DatacopierEnd::Internal(_) => -1,
        }
    }

    /// The errno behind the outcome. `0` at end of input, and for internal failures.
    #[must_use]
    pub fn errnoval(self) -> i32 {
        match self {
            DatacopierEnd::ReadError(errno)
            | DatacopierEnd::WriteError(errno)
            | DatacopierEnd::LogError(errno) => errno,
            DatacopierEnd::Eof | DatacopierEnd::Internal(_) => 0,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool { self == DatacopierEnd::Eof }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(DatacopierEnd::Eof, 0, 0)]
    #[test_case(DatacopierEnd::ReadError(libc::EIO), 0, libc::EIO)]
    #[test_case(DatacopierEnd::WriteError(libc::EPIPE), 1, libc::EPIPE)]
    #[test_case(DatacopierEnd::LogError(libc::ENOSPC), -1, libc::ENOSPC)]
    #[test_case(DatacopierEnd::Internal(DatacopierInternal::SizeExceeded), -1, 0)]
    fn legacy_onwrite_and_errnoval(end: DatacopierEnd, onwrite: i32, errnoval: i32) {
        assert_eq!((end.onwrite(), end.errnoval()), (onwrite, errnoval));
    }
}
