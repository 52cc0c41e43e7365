// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words osevent egc revents

//! Integration with an application that runs its own event loop.
//!
//! There are two ways to do it:
//!
//! 1. Install [`OsEventHooks`]. Every fd and timeout registration is mirrored to the
//!    hooks as it happens, and the application reports readiness back with
//!    [`Ctx::osevent_occurred_fd()`] and [`Ctx::osevent_occurred_timeout()`].
//! 2. Poll on the library's behalf: before each `poll(2)` call
//!    [`Ctx::osevent_beforepoll()`] to get the fds and the timeout, and afterwards hand
//!    the results to [`Ctx::osevent_afterpoll()`].
//!
//! [`Ctx::osevent_beforepoll()`]: crate::Ctx::osevent_beforepoll
//! [`Ctx::osevent_afterpoll()`]: crate::Ctx::osevent_afterpoll

use super::{Egc, EvId, ev_fd::fd_dispatch, ev_time::time_occurred};
use crate::Ctx;
use nix::poll::PollFlags;
use std::{io, os::fd::RawFd, time::Instant};

/// Names one registration to the application's event loop. Hand it back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsEventToken(pub(crate) EvId);

impl OsEventToken {
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0.as_u64() }
}

/// The application's side of fd and timeout registrations.
///
/// The hooks are called with the context lock held, and must not call back into the
/// library. A timeout that has been reported through
/// [`Ctx::osevent_occurred_timeout()`] is gone; `timeout_deregister` is not called for
/// it.
pub trait OsEventHooks: Send + Sync {
    /// # Errors
    ///
    /// If the application can't watch `fd`. The registration fails.
    fn fd_register(&self, fd: RawFd, events: PollFlags, token: OsEventToken) -> io::Result<()>;

    /// # Errors
    ///
    /// If the change can't be made. The old interest stays in force.
    fn fd_modify(&self, fd: RawFd, token: OsEventToken, events: PollFlags) -> io::Result<()>;

    fn fd_deregister(&self, fd: RawFd, token: OsEventToken);

    /// # Errors
    ///
    /// If the application can't schedule the timeout. The registration fails.
    fn timeout_register(&self, deadline: Instant, token: OsEventToken) -> io::Result<()>;

    /// # Errors
    ///
    /// If the change can't be made. The old deadline stays in force.
    fn timeout_modify(&self, token: OsEventToken, deadline: Instant) -> io::Result<()>;

    fn timeout_deregister(&self, token: OsEventToken);
}

impl Ctx {
    /// The application's loop saw `revents` on `fd`, registered with `token`. Stale tokens
    /// are ignored.
    pub fn osevent_occurred_fd(
        &self,
        token: OsEventToken,
        fd: RawFd,
        events: PollFlags,
        revents: PollFlags,
    ) {
        let mut egc = Egc::new(self);
        let _guard = self.lock();
        tracing::trace!(
            message = "osevent fd occurred",
            fd = fd,
            events = ?events,
            revents = ?revents,
            token = token.as_u64()
        );
        fd_dispatch(&mut egc, token.0, fd, revents);
    }

    /// The application's loop reached the deadline registered with `token`.
    pub fn osevent_occurred_timeout(&self, token: OsEventToken) {
        let mut egc = Egc::new(self);
        let _guard = self.lock();
        tracing::trace!(message = "osevent timeout occurred", token = token.as_u64());
        time_occurred(&mut egc, token.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CtxConfig, ErrorCode, EvFd, EvTime, MemStore,
                core::test_fixtures::pipe_pair};
    use pretty_assertions::assert_eq;
    use std::{os::fd::AsRawFd as _,
              sync::{Arc, Mutex,
                     atomic::{AtomicBool, Ordering}},
              time::Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        FdRegister(RawFd, PollFlags, OsEventToken),
        FdModify(RawFd, PollFlags),
        FdDeregister(RawFd, OsEventToken),
        TimeoutRegister(OsEventToken),
        TimeoutModify(OsEventToken),
        TimeoutDeregister(OsEventToken),
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<Call>>,
        refuse_fds: AtomicBool,
    }

    impl RecordingHooks {
        fn take(&self) -> Vec<Call> { std::mem::take(&mut *self.calls.lock().unwrap()) }
    }

    impl OsEventHooks for RecordingHooks {
        fn fd_register(&self, fd: RawFd, events: PollFlags, token: OsEventToken) -> io::Result<()> {
            if self.refuse_fds.load(Ordering::SeqCst) {
                return Err(io::Error::from_raw_os_error(libc::EMFILE));
            }
            self.calls.lock().unwrap().push(Call::FdRegister(fd, events, token));
            Ok(())
        }

        fn fd_modify(&self, fd: RawFd, _token: OsEventToken, events: PollFlags) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::FdModify(fd, events));
            Ok(())
        }

        fn fd_deregister(&self, fd: RawFd, token: OsEventToken) {
            self.calls.lock().unwrap().push(Call::FdDeregister(fd, token));
        }

        fn timeout_register(&self, _deadline: Instant, token: OsEventToken) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::TimeoutRegister(token));
            Ok(())
        }

        fn timeout_modify(&self, token: OsEventToken, _deadline: Instant) -> io::Result<()> {
            self.calls.lock().unwrap().push(Call::TimeoutModify(token));
            Ok(())
        }

        fn timeout_deregister(&self, token: OsEventToken) {
            self.calls.lock().unwrap().push(Call::TimeoutDeregister(token));
        }
    }

    fn ctx_with_hooks() -> (Ctx, Arc<RecordingHooks>) {
        let hooks = Arc::new(RecordingHooks::default());
        let store = Arc::new(MemStore::try_new().unwrap());
        let ctx = Ctx::new(CtxConfig::new(store).with_osevent_hooks(hooks.clone())).unwrap();
        (ctx, hooks)
    }

    #[test]
    fn fd_registrations_are_mirrored_and_dispatched() {
        let (ctx, hooks) = ctx_with_hooks();
        let (r, _w) = pipe_pair();
        let fd = r.as_raw_fd();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut ev = EvFd::new();
        let seen_cb = seen.clone();
        ev.register(
            &ctx,
            move |_, _, _, revents| seen_cb.lock().unwrap().push(revents),
            fd,
            PollFlags::POLLIN,
        )
        .unwrap();
        let calls = hooks.take();
        let token = match calls.as_slice() {
            [Call::FdRegister(it, events, token)] if *it == fd && *events == PollFlags::POLLIN => {
                *token
            }
            other => panic!("unexpected hook calls {other:?}"),
        };

        ev.modify(&ctx, PollFlags::POLLIN | PollFlags::POLLPRI).unwrap();
        assert_eq!(hooks.take(), vec![Call::FdModify(fd, PollFlags::POLLIN | PollFlags::POLLPRI)]);

        // POLLOUT wasn't asked for, so it's masked off.
        ctx.osevent_occurred_fd(token, fd, PollFlags::POLLIN, PollFlags::POLLIN | PollFlags::POLLOUT);
        assert_eq!(*seen.lock().unwrap(), vec![PollFlags::POLLIN]);

        ev.deregister(&ctx);
        assert_eq!(hooks.take(), vec![Call::FdDeregister(fd, token)]);

        // Stale token, nothing happens.
        ctx.osevent_occurred_fd(token, fd, PollFlags::POLLIN, PollFlags::POLLIN);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn refused_fd_registration_leaves_the_handle_idle() {
        let (ctx, hooks) = ctx_with_hooks();
        hooks.refuse_fds.store(true, Ordering::SeqCst);
        let (r, _w) = pipe_pair();

        let mut ev = EvFd::new();
        let err = ev
            .register(&ctx, |_, _, _, _| {}, r.as_raw_fd(), PollFlags::POLLIN)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::OseventRegFail);
        assert!(!ev.is_registered());
        assert_eq!(ctx.with_state(|st| st.fds.len()), 0);
    }

    #[test]
    fn timeouts_fire_when_the_application_says_so() {
        let (ctx, hooks) = ctx_with_hooks();
        let fired = Arc::new(AtomicBool::new(false));

        let mut ev = EvTime::new();
        let fired_cb = fired.clone();
        ev.register_rel(
            &ctx,
            move |_, _| fired_cb.store(true, Ordering::SeqCst),
            Some(Duration::from_secs(3600)),
        )
        .unwrap();
        let token = match hooks.take().as_slice() {
            [Call::TimeoutRegister(token)] => *token,
            other => panic!("unexpected hook calls {other:?}"),
        };

        ev.modify_rel(&ctx, Some(Duration::from_secs(7200))).unwrap();
        assert_eq!(hooks.take(), vec![Call::TimeoutModify(token)]);

        ctx.osevent_occurred_timeout(token);
        assert!(fired.load(Ordering::SeqCst));
        assert!(!ev.is_registered());

        // Already gone, so deregister doesn't bother the hooks.
        ev.deregister(&ctx);
        assert!(hooks.take().is_empty());
    }
}
