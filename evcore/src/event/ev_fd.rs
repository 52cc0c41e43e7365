// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc osevent revents

use super::{Egc, EvId, OsEventToken, RegLink};
use crate::{CoreError, CoreResult, Ctx};
use nix::poll::PollFlags;
use std::{collections::BTreeMap,
          os::fd::RawFd,
          sync::{Arc, atomic::AtomicBool}};

/// Called with the fd, the registered events, and what happened. `revents` is masked
/// to the registered events plus `POLLERR`, `POLLHUP` and `POLLNVAL`.
pub type FdCallback = Box<dyn FnMut(&mut Egc, RawFd, PollFlags, PollFlags) + Send>;

pub(crate) struct FdReg {
    fd: RawFd,
    events: PollFlags,
    cb: Option<FdCallback>,
    live: Arc<AtomicBool>,
}

/// All fd registrations, in registration order.
#[derive(Default)]
pub(crate) struct FdTable {
    regs: BTreeMap<EvId, FdReg>,
}

impl FdTable {
    pub(crate) fn iter(&self) -> impl Iterator<Item = (EvId, RawFd, PollFlags)> + '_ {
        self.regs.iter().map(|(id, reg)| (*id, reg.fd, reg.events))
    }

    pub(crate) fn len(&self) -> usize { self.regs.len() }
}

/// Interest in readiness of one fd. See the [module docs](super) for the contract shared
/// by all event sources.
#[derive(Debug, Default)]
pub struct EvFd {
    link: Option<RegLink>,
    fd: RawFd,
}

impl EvFd {
    #[must_use]
    pub fn new() -> Self { Self { link: None, fd: -1 } }

    /// Resets a handle that is not registered. Idempotent.
    pub fn init(&mut self) {
        debug_assert!(!self.is_registered(), "init of a registered EvFd");
        *self = Self::new();
    }

    #[must_use]
    pub fn is_registered(&self) -> bool { self.link.as_ref().is_some_and(RegLink::is_live) }

    /// The registered fd, or -1.
    #[must_use]
    pub fn fd(&self) -> RawFd { if self.is_registered() { self.fd } else { -1 } }

    /// Registering an fd and interest that is already registered elsewhere is a caller
    /// bug; nothing checks for it.
    ///
    /// # Errors
    ///
    /// [`CoreError::OseventRegFail`] if the application's event-loop hooks refuse it.
    /// The handle stays Idle.
    pub fn register(
        &mut self,
        ctx: &Ctx,
        callback: impl FnMut(&mut Egc, RawFd, PollFlags, PollFlags) + Send + 'static,
        fd: RawFd,
        events: PollFlags,
    ) -> CoreResult<()> {
        let _guard = ctx.lock();
        debug_assert!(!self.is_registered(), "EvFd registered twice");

        let callback: FdCallback = Box::new(callback);
        let (id, hooks) = ctx.with_state(|st| (st.alloc_id(), st.osevent_hooks.clone()));
        let (link, live) = RegLink::new(id);
        ctx.with_state(|st| {
            st.fds.regs.insert(
                id,
                FdReg {
                    fd,
                    events,
                    cb: Some(callback),
                    live,
                },
            );
        });

        if let Some(hooks) = hooks
            && let Err(source) = hooks.fd_register(fd, events, OsEventToken(id))
        {
            let leftover = ctx.with_state(|st| st.fds.regs.remove(&id));
            drop(leftover);
            tracing::error!(message = "ev_fd register refused by hooks", fd = fd, error = ?source);
            return Err(CoreError::OseventRegFail { what: "fd", source });
        }

        tracing::debug!(message = "ev_fd register", fd = fd, events = ?events, id = id.0);
        self.link = Some(link);
        self.fd = fd;
        ctx.osevent_changed();
        Ok(())
    }

    /// Changes the events of interest. The handle stays registered either way; on error
    /// the old events stay in force.
    ///
    /// # Errors
    ///
    /// [`CoreError::Invalid`] if the handle is Idle, [`CoreError::OseventRegFail`] if the
    /// hooks refuse the change.
    pub fn modify(&mut self, ctx: &Ctx, events: PollFlags) -> CoreResult<()> {
        let _guard = ctx.lock();
        let Some(link) = self.link.as_ref().filter(|it| it.is_live()) else {
            return Err(CoreError::Invalid {
                what: "modify of an unregistered fd event".into(),
            });
        };
        let id = link.id;

        let hooks = ctx.with_state(|st| st.osevent_hooks.clone());
        if let Some(hooks) = hooks
            && let Err(source) = hooks.fd_modify(self.fd, OsEventToken(id), events)
        {
            tracing::error!(message = "ev_fd modify refused by hooks", fd = self.fd, error = ?source);
            return Err(CoreError::OseventRegFail { what: "fd", source });
        }

        ctx.with_state(|st| {
            if let Some(reg) = st.fds.regs.get_mut(&id) {
                reg.events = events;
            }
        });
        tracing::debug!(message = "ev_fd modify", fd = self.fd, events = ?events, id = id.0);
        ctx.osevent_changed();
        Ok(())
    }

    /// Idempotent. No callback runs for this registration once this returns.
    pub fn deregister(&mut self, ctx: &Ctx) {
        let Some(link) = self.link.take() else {
            return;
        };
        if !link.kill() {
            return;
        }
        let _guard = ctx.lock();
        let (removed, hooks) =
            ctx.with_state(|st| (st.fds.regs.remove(&link.id), st.osevent_hooks.clone()));
        if removed.is_some()
            && let Some(hooks) = hooks
        {
            hooks.fd_deregister(self.fd, OsEventToken(link.id));
        }
        tracing::debug!(message = "ev_fd deregister", fd = self.fd, id = link.id.0);
        drop(removed);
        self.fd = -1;
    }
}

/// Runs the callback of registration `id` if it is still registered on `fd` and
/// `revents` overlaps what it asked for. Caller holds the lock.
pub(crate) fn fd_dispatch(egc: &mut Egc, id: EvId, fd: RawFd, revents: PollFlags) {
    let ctx = egc.ctx().clone();
    let taken = ctx.with_state(|st| {
        let reg = st.fds.regs.get_mut(&id)?;
        if reg.fd != fd {
            return None;
        }
        let masked = revents
            & (reg.events | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL);
        if masked.is_empty() {
            return None;
        }
        Some((reg.cb.take()?, reg.events, masked))
    });
    let Some((mut callback, events, masked)) = taken else {
        return;
    };

    callback(egc, fd, events, masked);

    // Put it back unless the callback deregistered it.
    let leftover = ctx.with_state(|st| match st.fds.regs.get_mut(&id) {
        Some(reg) if reg.cb.is_none() => {
            reg.cb = Some(callback);
            None
        }
        _ => Some(callback),
    });
    drop(leftover);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_fixtures::{drive_until, new_test_ctx, pipe_pair};
    use pretty_assertions::assert_eq;
    use std::{sync::{Mutex,
                     atomic::{AtomicUsize, Ordering}},
              time::Duration};

    #[test]
    fn register_and_deregister_are_idempotent() {
        let (ctx, _store) = new_test_ctx();
        let (r, _w) = pipe_pair();
        let raw = std::os::fd::AsRawFd::as_raw_fd(&r);

        let mut ev = EvFd::new();
        ev.init();
        assert!(!ev.is_registered());
        ev.register(&ctx, |_, _, _, _| {}, raw, PollFlags::POLLIN).unwrap();
        assert!(ev.is_registered());
        assert_eq!(ev.fd(), raw);

        ev.deregister(&ctx);
        assert!(!ev.is_registered());
        ev.deregister(&ctx);
        assert!(!ev.is_registered());
        assert_eq!(ev.fd(), -1);
        assert_eq!(ctx.with_state(|st| st.fds.len()), 0);
    }

    #[test]
    fn readable_fd_fires_with_masked_revents() {
        let (ctx, _store) = new_test_ctx();
        let (r, w) = pipe_pair();
        let raw = std::os::fd::AsRawFd::as_raw_fd(&r);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut ev = EvFd::new();
        let seen_cb = seen.clone();
        ev.register(
            &ctx,
            move |_, fd, events, revents| {
                seen_cb.lock().unwrap().push((fd, events, revents));
            },
            raw,
            PollFlags::POLLIN,
        )
        .unwrap();

        rustix::io::write(&w, b"x").unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(5), || {
            !seen.lock().unwrap().is_empty()
        }));
        let (fd, events, revents) = seen.lock().unwrap()[0];
        assert_eq!(fd, raw);
        assert_eq!(events, PollFlags::POLLIN);
        assert!(revents.contains(PollFlags::POLLIN));
        assert!(!revents.contains(PollFlags::POLLOUT));
        ev.deregister(&ctx);
    }

    #[test]
    fn callback_may_deregister_itself() {
        let (ctx, _store) = new_test_ctx();
        let (r, w) = pipe_pair();
        let raw = std::os::fd::AsRawFd::as_raw_fd(&r);
        let calls = Arc::new(AtomicUsize::new(0));
        let ev = Arc::new(parking_lot::Mutex::new(EvFd::new()));

        let calls_cb = calls.clone();
        let ev_cb = ev.clone();
        ev.lock()
            .register(
                &ctx,
                move |egc, _, _, _| {
                    calls_cb.fetch_add(1, Ordering::SeqCst);
                    ev_cb.lock().deregister(egc.ctx());
                },
                raw,
                PollFlags::POLLIN,
            )
            .unwrap();

        // Stays readable, so a second dispatch would happen if the registration lived.
        rustix::io::write(&w, b"xy").unwrap();
        drive_until(&ctx, Duration::from_millis(300), || false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ev.lock().is_registered());
    }

    #[test]
    fn modify_of_idle_handle_is_invalid() {
        let (ctx, _store) = new_test_ctx();
        let mut ev = EvFd::new();
        let err = ev.modify(&ctx, PollFlags::POLLOUT).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Inval);
    }
}
