// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words carefd cloexec noexec

//! Fork-safe descriptor creation.
//!
//! A descriptor opened in one thread while another thread forks leaks into the child,
//! even if it is marked close-on-exec a moment later. The bracket here closes that
//! window: [`begin()`] takes a process-wide guard that [`EvChild::fork()`] also holds
//! across `fork(2)`, so no fork can happen between a descriptor being opened and it
//! being [`record()`]ed (which sets `FD_CLOEXEC`).
//!
//! While a bracket is open the thread must not block, call application code, fork, or
//! start another bracket.
//!
//! ```no_run
//! use gmctl_evcore::carefd;
//!
//! let mut bracket = carefd::begin();
//! let (r, w) = rustix::pipe::pipe().unwrap();
//! let r = bracket.record(r);
//! let w = bracket.record(w);
//! bracket.unlock();
//! # drop((r, w));
//! ```
//!
//! [`EvChild::fork()`]: crate::EvChild::fork
//! [`record()`]: CarefdBracket::record

use parking_lot::{Mutex, MutexGuard, const_mutex};
use std::os::fd::{AsRawFd as _, BorrowedFd, OwnedFd, RawFd};

static CAREFDS: Mutex<CarefdTable> = const_mutex(CarefdTable { fds: Vec::new() });

struct CarefdTable {
    fds: Vec<RawFd>,
}

/// An open bracket. See the [module docs](self).
#[must_use = "the fork guard is released when the bracket is dropped"]
pub struct CarefdBracket {
    table: MutexGuard<'static, CarefdTable>,
}

/// Takes the process-wide no-fork guard. Pair with [`CarefdBracket::unlock()`] or
/// [`CarefdBracket::opened()`].
pub fn begin() -> CarefdBracket {
    CarefdBracket {
        table: CAREFDS.lock(),
    }
}

impl CarefdBracket {
    /// Takes ownership of `fd`, marks it close-on-exec and tracks it. [`None`] gives a
    /// guard that does nothing.
    pub fn record(&mut self, fd: impl Into<Option<OwnedFd>>) -> Carefd {
        let fd = fd.into();
        if let Some(fd) = &fd {
            set_cloexec(fd);
            self.table.fds.push(fd.as_raw_fd());
        }
        Carefd { fd }
    }

    /// Ends the bracket.
    pub fn unlock(self) { drop(self); }

    /// [`record()`](Self::record) then [`unlock()`](Self::unlock), for the common case of
    /// a single descriptor.
    pub fn opened(mut self, fd: impl Into<Option<OwnedFd>>) -> Carefd {
        let it = self.record(fd);
        self.unlock();
        it
    }
}

fn set_cloexec(fd: &OwnedFd) {
    let result = rustix::io::fcntl_getfd(fd).and_then(|flags| {
        rustix::io::fcntl_setfd(fd, flags | rustix::io::FdFlags::CLOEXEC)
    });
    if let Err(err) = result {
        tracing::error!(message = "failed to set FD_CLOEXEC", fd = fd.as_raw_fd(), error = ?err);
    }
}

/// A descriptor opened inside a bracket. Closing it (with [`close()`](Self::close) or by
/// dropping it) takes the fork guard, so it never races a fork.
#[derive(Debug)]
pub struct Carefd {
    fd: Option<OwnedFd>,
}

impl Carefd {
    /// A guard holding no descriptor.
    #[must_use]
    pub fn none() -> Self { Self { fd: None } }

    /// The raw descriptor, or -1.
    #[must_use]
    pub fn fd(&self) -> RawFd { self.fd.as_ref().map_or(-1, |it| it.as_raw_fd()) }

    #[must_use]
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(std::os::fd::AsFd::as_fd)
    }

    /// Closes the descriptor exactly once. No-op for -1.
    pub fn close(mut self) { self.close_inner(); }

    fn close_inner(&mut self) {
        let Some(fd) = self.fd.take() else {
            return;
        };
        let mut table = CAREFDS.lock();
        let raw = fd.as_raw_fd();
        table.fds.retain(|it| *it != raw);
        drop(fd);
    }
}

impl Drop for Carefd {
    fn drop(&mut self) { self.close_inner(); }
}

/// For a forked child that will not exec: closes every descriptor opened through a
/// bracket. Must not be called from inside a bracket.
pub fn postfork_child_noexec() {
    let mut table = match CAREFDS.try_lock() {
        Some(it) => it,
        None => {
            // SAFETY: after fork the child has one thread. Whoever held the guard in
            // the parent does not exist here, and can never release it.
            unsafe { CAREFDS.force_unlock() };
            CAREFDS.lock()
        }
    };
    for fd in table.fds.drain(..) {
        if let Err(err) = nix::unistd::close(fd) {
            tracing::debug!(message = "postfork close failed", fd = fd, error = ?err);
        }
    }
}

#[cfg(test)]
pub(crate) fn tracked_count() -> usize { CAREFDS.lock().fds.len() }

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn is_cloexec(fd: BorrowedFd<'_>) -> bool {
        rustix::io::fcntl_getfd(fd)
            .unwrap()
            .contains(rustix::io::FdFlags::CLOEXEC)
    }

    #[test]
    #[serial]
    fn close_closes_exactly_once() {
        let before = tracked_count();
        let (r, w) = rustix::pipe::pipe().unwrap();

        let mut bracket = begin();
        let w = bracket.record(w);
        bracket.unlock();

        assert!(is_cloexec(w.as_fd().unwrap()));
        assert_eq!(tracked_count(), before + 1);

        w.close();
        assert_eq!(tracked_count(), before);

        // The write end is gone, so the reader sees EOF straight away.
        let mut buf = [0_u8; 1];
        assert_eq!(rustix::io::read(&r, &mut buf).unwrap(), 0);
    }

    #[test]
    #[serial]
    fn minus_one_is_a_no_op() {
        let before = tracked_count();
        let it = begin().opened(None);
        assert_eq!(it.fd(), -1);
        assert!(it.as_fd().is_none());
        it.close();
        Carefd::none().close();
        assert_eq!(tracked_count(), before);
    }

    #[test]
    #[serial]
    fn drop_closes_too() {
        let before = tracked_count();
        let (r, w) = rustix::pipe::pipe().unwrap();
        {
            let _w = begin().opened(w);
            assert_eq!(tracked_count(), before + 1);
        }
        assert_eq!(tracked_count(), before);
        let mut buf = [0_u8; 1];
        assert_eq!(rustix::io::read(&r, &mut buf).unwrap(), 0);
    }
}
