// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc osevent revents pollfd pollfds nfds beforepoll afterpoll

//! Pollers: the `poll(2)` side of the event loop.
//!
//! A thread that has to wait for something (a synchronous [`Ao`], [`Ctx::event_wait()`])
//! takes a [`Poller`] and runs [`eventloop_iteration()`] until it is done. Each
//! iteration rebuilds the pollfd array from the fd registrations, releases the lock for
//! the `poll(2)` call, then takes it back and dispatches whatever became ready.
//!
//! Every poller has a wakeup pipe whose read end is always polled. Any change to the
//! fd or timer registrations writes to the wakeup pipe of every poller that is in
//! `poll(2)` right now, so it re-fills with the new set.
//!
//! [`Ao`]: crate::Ao

use super::{Egc, EvId, FdTable, TimerQueue, ev_fd::fd_dispatch, ev_time::fire_expired_timers};
use crate::{CoreError, CoreResult, Ctx, CtxGuard};
use mio::unix::pipe;
use nix::poll::PollFlags;
use smallvec::SmallVec;
use std::{collections::HashMap,
          io::{self, Read as _, Write as _},
          os::fd::{AsRawFd as _, RawFd},
          sync::Arc,
          time::Instant};

/// Write end and read end of a poller's self-pipe. Shared with whoever needs to wake it.
#[derive(Debug)]
pub(crate) struct PollerWakeup {
    tx: pipe::Sender,
    rx: pipe::Receiver,
}

impl PollerWakeup {
    fn try_new() -> CoreResult<Self> {
        let (tx, rx) =
            pipe::new().map_err(|err| CoreError::os("creating a poller wakeup pipe", err))?;
        Ok(Self { tx, rx })
    }

    pub(crate) fn wakeup(&self) {
        match (&self.tx).write(&[1]) {
            Ok(_) => {}
            // Full pipe, already going to wake up.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => tracing::error!(message = "poller wakeup write failed", error = ?err),
        }
    }

    fn drain(&self) {
        let mut buf = [0_u8; 256];
        loop {
            match (&self.rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }

    fn fd(&self) -> RawFd { self.rx.as_raw_fd() }
}

/// Readiness of one fd, as exchanged with an application that polls on the library's
/// behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSlot {
    pub fd: RawFd,
    pub events: PollFlags,
    /// Filled in by the application after `poll(2)`.
    pub revents: PollFlags,
}

/// Ready entries from one `poll(2)` cycle. Usually only a handful.
pub(crate) type ReadyList = SmallVec<[(EvId, RawFd, PollFlags); 8]>;

/// A pollfd array mirroring the fd registrations, plus a wakeup pipe. Only one thread
/// polls with a given poller at a time.
pub(crate) struct Poller {
    id: u64,
    wakeup: Arc<PollerWakeup>,
    pollfds: Vec<libc::pollfd>,
    /// Index into `pollfds` by fd. Several registrations on one fd share a slot.
    fd_index: HashMap<RawFd, usize>,
    /// The registrations this cycle's array was built from.
    polled: Vec<(EvId, RawFd)>,
}

impl Poller {
    pub(crate) fn try_new(id: u64) -> CoreResult<Self> {
        Ok(Self {
            id,
            wakeup: Arc::new(PollerWakeup::try_new()?),
            pollfds: Vec::new(),
            fd_index: HashMap::new(),
            polled: Vec::new(),
        })
    }

    pub(crate) fn wakeup_handle(&self) -> Arc<PollerWakeup> { self.wakeup.clone() }

    /// Rebuilds the pollfd array. Returns the `poll(2)` timeout in milliseconds for the
    /// earliest timer, or -1 if there is none.
    pub(crate) fn fill(&mut self, fds: &FdTable, timers: &TimerQueue, now: Instant) -> i32 {
        self.pollfds.clear();
        self.fd_index.clear();
        self.polled.clear();

        self.push(self.wakeup.fd(), PollFlags::POLLIN);
        for (id, fd, events) in fds.iter() {
            self.push(fd, events);
            self.polled.push((id, fd));
        }
        timeout_ms(timers.next_deadline(), now)
    }

    fn push(&mut self, fd: RawFd, events: PollFlags) {
        match self.fd_index.get(&fd) {
            Some(&index) => self.pollfds[index].events |= events.bits(),
            None => {
                self.fd_index.insert(fd, self.pollfds.len());
                self.pollfds.push(libc::pollfd {
                    fd,
                    events: events.bits(),
                    revents: 0,
                });
            }
        }
    }

    /// # Errors
    ///
    /// If `poll(2)` fails for any reason other than being interrupted.
    pub(crate) fn poll(&mut self, timeout_ms: i32) -> CoreResult<()> {
        let nfds = libc::nfds_t::try_from(self.pollfds.len()).unwrap_or(libc::nfds_t::MAX);
        // SAFETY: `pollfds` is a live array of `nfds` entries for the whole call.
        let rc = unsafe { libc::poll(self.pollfds.as_mut_ptr(), nfds, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(CoreError::os("poll", err));
        }
        Ok(())
    }

    fn revents_of(&self, fd: RawFd) -> PollFlags {
        self.fd_index
            .get(&fd)
            .and_then(|index| self.pollfds.get(*index))
            .map_or(PollFlags::empty(), |it| PollFlags::from_bits_truncate(it.revents))
    }

    pub(crate) fn ready(&self) -> ReadyList {
        self.polled
            .iter()
            .filter_map(|(id, fd)| {
                let revents = self.revents_of(*fd);
                (!revents.is_empty()).then_some((*id, *fd, revents))
            })
            .collect()
    }

    /// Copies the application's `revents` back into the array.
    fn absorb(&mut self, slots: &[PollSlot]) {
        for it in &mut self.pollfds {
            it.revents = 0;
        }
        for slot in slots {
            if let Some(index) = self.fd_index.get(&slot.fd) {
                self.pollfds[*index].revents |= slot.revents.bits();
            }
        }
    }
}

fn timeout_ms(deadline: Option<Instant>, now: Instant) -> i32 {
    let Some(deadline) = deadline else {
        return -1;
    };
    let left = deadline.saturating_duration_since(now);
    // Round up, so a poll never returns just short of the deadline.
    i32::try_from(left.as_micros().div_ceil(1000)).unwrap_or(i32::MAX)
}

/// The context's pollers. The app poller serves `osevent_beforepoll` and
/// `osevent_afterpoll` and is never lent out.
pub(crate) struct PollerLists {
    app: Poller,
    idle: Vec<Poller>,
    in_poll: Vec<(u64, Arc<PollerWakeup>)>,
    /// Pollers of threads blocked in [`Ctx::event_wait()`].
    event_waiters: Vec<(u64, Arc<PollerWakeup>)>,
    next_id: u64,
}

impl PollerLists {
    pub(crate) fn new(app: Poller) -> Self {
        Self {
            next_id: app.id + 1,
            app,
            idle: Vec::new(),
            in_poll: Vec::new(),
            event_waiters: Vec::new(),
        }
    }

    pub(crate) fn idle_count(&self) -> usize { self.idle.len() }
}

impl Ctx {
    /// A poller from the idle list, or a new one.
    pub(crate) fn poller_get(&self) -> CoreResult<Poller> {
        let (idle, id) = self.with_state(|st| {
            let lists = &mut st.pollers;
            let idle = lists.idle.pop();
            let id = lists.next_id;
            if idle.is_none() {
                lists.next_id += 1;
            }
            (idle, id)
        });
        match idle {
            Some(poller) => Ok(poller),
            None => Poller::try_new(id),
        }
    }

    pub(crate) fn poller_put(&self, poller: Poller) {
        poller.wakeup.drain();
        self.with_state(|st| st.pollers.idle.push(poller));
    }

    /// Wakes every poller currently in `poll(2)`, and the application's loop.
    pub(crate) fn osevent_changed(&self) {
        let wakeups: Vec<Arc<PollerWakeup>> = self.with_state(|st| {
            let lists = &st.pollers;
            lists
                .in_poll
                .iter()
                .map(|(_, it)| it.clone())
                .chain(std::iter::once(lists.app.wakeup.clone()))
                .collect()
        });
        for it in wakeups {
            it.wakeup();
        }
    }

    pub(crate) fn pollers_event_add(&self, poller: &Poller) {
        let entry = (poller.id, poller.wakeup.clone());
        self.with_state(|st| st.pollers.event_waiters.push(entry));
    }

    pub(crate) fn pollers_event_remove(&self, poller: &Poller) {
        self.with_state(|st| st.pollers.event_waiters.retain(|(id, _)| *id != poller.id));
    }

    /// Wakes the threads in [`Ctx::event_wait()`].
    pub(crate) fn pollers_event_wake(&self) {
        let wakeups: Vec<Arc<PollerWakeup>> = self.with_state(|st| {
            st.pollers
                .event_waiters
                .iter()
                .map(|(_, it)| it.clone())
                .collect()
        });
        for it in wakeups {
            it.wakeup();
        }
    }

    /// Fills `slots` with the fds the library wants polled, and lowers `timeout_ms` if a
    /// timer is due sooner. A negative `timeout_ms` means infinite, as for `poll(2)`.
    pub fn osevent_beforepoll(&self, slots: &mut Vec<PollSlot>, timeout_ms: &mut i32, now: Instant) {
        let _guard = self.lock();
        self.with_state(|st| {
            let app = &mut st.pollers.app;
            let timeout = app.fill(&st.fds, &st.timers, now);
            slots.clear();
            slots.extend(app.pollfds.iter().map(|it| PollSlot {
                fd: it.fd,
                events: PollFlags::from_bits_truncate(it.events),
                revents: PollFlags::empty(),
            }));
            if timeout >= 0 && (*timeout_ms < 0 || timeout < *timeout_ms) {
                *timeout_ms = timeout;
            }
        });
    }

    /// Dispatches what the application's `poll(2)` found, then any timers due at `now`.
    pub fn osevent_afterpoll(&self, slots: &[PollSlot], now: Instant) {
        let mut egc = Egc::new(self);
        let _guard = self.lock();
        let ready = self.with_state(|st| {
            let app = &mut st.pollers.app;
            app.absorb(slots);
            app.ready()
        });
        for (id, fd, revents) in ready {
            fd_dispatch(&mut egc, id, fd, revents);
        }
        fire_expired_timers(&mut egc, now);
        let wakeup = self.with_state(|st| st.pollers.app.wakeup.clone());
        wakeup.drain();
    }
}

/// One round of the internal event loop: fill, poll with the lock released, dispatch fd
/// callbacks, fire due timers. The caller holds the lock through `guard`.
///
/// # Errors
///
/// If `poll(2)` fails.
pub(crate) fn eventloop_iteration(
    egc: &mut Egc,
    guard: &mut CtxGuard<'_>,
    poller: &mut Poller,
) -> CoreResult<()> {
    let ctx = egc.ctx().clone();
    let timeout = ctx.with_state(|st| poller.fill(&st.fds, &st.timers, Instant::now()));

    let entry = (poller.id, poller.wakeup.clone());
    ctx.with_state(|st| st.pollers.in_poll.push(entry));
    let polled = guard.unlocked(|| poller.poll(timeout));
    ctx.with_state(|st| st.pollers.in_poll.retain(|(id, _)| *id != poller.id));
    polled?;

    for (id, fd, revents) in poller.ready() {
        fd_dispatch(egc, id, fd, revents);
    }
    fire_expired_timers(egc, Instant::now());
    poller.wakeup.drain();
    Ok(())
}
