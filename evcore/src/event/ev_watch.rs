// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc unwatch epath wpath

use super::{Egc, EvFd};
use crate::{CoreError, CoreResult, Ctx, WATCH_SLOT_GROWTH};
use nix::poll::PollFlags;

/// Called with the watched path and the path that changed, on every change.
pub type WatchCallback = Box<dyn FnMut(&mut Egc, &str, &str) + Send>;

pub(crate) enum WatchSlot {
    Free {
        next: Option<usize>,
    },
    Occupied {
        path: String,
        counter: u32,
        cb: Option<WatchCallback>,
    },
}

/// Slot table for store watches. The store hands back a token per event; the token
/// names a slot and the counter value the slot was stamped with, so an event for a slot
/// that has since been reused is recognised and dropped.
#[derive(Default)]
pub(crate) struct WatchTable {
    slots: Vec<WatchSlot>,
    free_head: Option<usize>,
    counter: u32,
    nwatches: usize,
    /// Registered on the store's watch fd while `nwatches > 0`.
    efd: EvFd,
}

impl WatchTable {
    /// Index of the slot the next watch will take, growing the table if it is full.
    fn next_free(&mut self) -> usize {
        if let Some(slot) = self.free_head {
            return slot;
        }
        let old_len = self.slots.len();
        let new_len = (old_len + 1) * WATCH_SLOT_GROWTH;
        // Lowest index ends up at the head of the free list.
        for slot in old_len..new_len {
            let next = if slot + 1 < new_len { Some(slot + 1) } else { None };
            self.slots.push(WatchSlot::Free { next });
        }
        self.free_head = Some(old_len);
        old_len
    }

    fn occupy(&mut self, slot: usize, path: String, cb: WatchCallback) -> u32 {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        let next = match self.slots.get(slot) {
            Some(WatchSlot::Free { next }) => *next,
            _ => None,
        };
        self.free_head = next;
        self.slots[slot] = WatchSlot::Occupied {
            path,
            counter,
            cb: Some(cb),
        };
        self.nwatches += 1;
        counter
    }

    /// Frees `slot` if it still holds the watch stamped with `counter`.
    fn release(&mut self, slot: usize, counter: u32) -> Option<(String, Option<WatchCallback>)> {
        match self.slots.get(slot) {
            Some(WatchSlot::Occupied { counter: it, .. }) if *it == counter => {}
            _ => return None,
        }
        let old = std::mem::replace(
            &mut self.slots[slot],
            WatchSlot::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(slot);
        self.nwatches -= 1;
        match old {
            WatchSlot::Occupied { path, cb, .. } => Some((path, cb)),
            WatchSlot::Free { .. } => None,
        }
    }

    pub(crate) fn nwatches(&self) -> usize { self.nwatches }

    pub(crate) fn nslots(&self) -> usize { self.slots.len() }
}

/// The token the store carries back for a watch: `"<slot>/<counter in hex>"`.
pub(crate) fn watch_token(slot: usize, counter: u32) -> String { format!("{slot}/{counter:x}") }

pub(crate) fn parse_watch_token(token: &str) -> Option<(usize, u32)> {
    let (slot, counter) = token.split_once('/')?;
    Some((
        slot.parse().ok()?,
        u32::from_str_radix(counter, 16).ok()?,
    ))
}

/// A watch on a store path and everything below it. Fires once straight after it is
/// registered, then on every change.
#[derive(Debug, Default)]
pub struct EvWatch {
    /// `(slot, counter)` while registered.
    slot: Option<(usize, u32)>,
    path: Option<String>,
}

impl EvWatch {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Resets a handle that is not registered. Idempotent.
    pub fn init(&mut self) {
        debug_assert!(!self.is_registered(), "init of a registered EvWatch");
        *self = Self::new();
    }

    #[must_use]
    pub fn is_registered(&self) -> bool { self.slot.is_some() }

    #[must_use]
    pub fn path(&self) -> Option<&str> { self.path.as_deref() }

    /// # Errors
    ///
    /// If the store watch fd can't be registered, or the store refuses the watch. The
    /// handle stays Idle.
    pub fn register(
        &mut self,
        ctx: &Ctx,
        callback: impl FnMut(&mut Egc, &str, &str) + Send + 'static,
        path: &str,
    ) -> CoreResult<()> {
        let _guard = ctx.lock();
        debug_assert!(!self.is_registered(), "EvWatch registered twice");

        ensure_watch_efd(ctx)?;

        let (slot, counter, store) =
            ctx.with_state(|st| (st.watches.next_free(), st.watches.counter, st.store.clone()));
        let token = watch_token(slot, counter);

        if let Err(err) = store.watch(path, &token) {
            tracing::error!(message = "store watch failed", path = path, error = ?err);
            release_watch_efd_if_idle(ctx);
            return Err(CoreError::Store(err));
        }

        let stamped = ctx.with_state(|st| {
            st.watches
                .occupy(slot, path.to_string(), Box::new(callback))
        });
        debug_assert_eq!(stamped, counter);
        tracing::debug!(message = "watch register", path = path, token = %token);
        self.slot = Some((slot, counter));
        self.path = Some(path.to_string());
        Ok(())
    }

    /// Idempotent. If the store refuses to drop the watch, that is logged; its events
    /// keep arriving and are ignored.
    pub fn deregister(&mut self, ctx: &Ctx) {
        let Some((slot, counter)) = self.slot.take() else {
            return;
        };
        self.path = None;
        let _guard = ctx.lock();
        let (released, store) =
            ctx.with_state(|st| (st.watches.release(slot, counter), st.store.clone()));
        let Some((path, callback)) = released else {
            return;
        };

        let token = watch_token(slot, counter);
        if let Err(err) = store.unwatch(&path, &token) {
            tracing::error!(
                message = "remove watch failed, its events will be ignored",
                path = %path,
                token = %token,
                error = ?err,
            );
        }
        tracing::debug!(message = "watch deregister", path = %path, token = %token);
        drop(callback);
        release_watch_efd_if_idle(ctx);
    }
}

fn ensure_watch_efd(ctx: &Ctx) -> CoreResult<()> {
    let (needed, fd) =
        ctx.with_state(|st| (!st.watches.efd.is_registered(), st.store.watch_fd()));
    if !needed {
        return Ok(());
    }
    let mut efd = EvFd::new();
    efd.register(ctx, watchfd_callback, fd, PollFlags::POLLIN)?;
    ctx.with_state(|st| st.watches.efd = efd);
    Ok(())
}

fn release_watch_efd_if_idle(ctx: &Ctx) {
    let efd = ctx.with_state(|st| {
        (st.watches.nwatches == 0).then(|| std::mem::take(&mut st.watches.efd))
    });
    if let Some(mut efd) = efd {
        efd.deregister(ctx);
    }
}

fn watchfd_callback(egc: &mut Egc, _fd: i32, _events: PollFlags, _revents: PollFlags) {
    let store = egc.ctx().store();
    loop {
        match store.check_watch() {
            Ok(Some(event)) => watch_dispatch(egc, &event.token, &event.path),
            Ok(None) => break,
            Err(err) => {
                egc.event_disaster("cannot check/read watches", err.errno(), None);
                return;
            }
        }
    }
}

fn watch_dispatch(egc: &mut Egc, token: &str, epath: &str) {
    let Some((slot, counter)) = parse_watch_token(token) else {
        tracing::debug!(message = "watch event with malformed token", epath = epath, token = token);
        return;
    };
    let ctx = egc.ctx().clone();
    let taken = ctx.with_state(|st| match st.watches.slots.get_mut(slot) {
        None => Err("slot out of range"),
        Some(WatchSlot::Free { .. }) => Err("empty slot"),
        Some(WatchSlot::Occupied { counter: it, .. }) if *it != counter => Err("stale counter"),
        Some(WatchSlot::Occupied { path, cb, .. }) => {
            cb.take().map(|cb| (path.clone(), cb)).ok_or("callback busy")
        }
    });
    let (wpath, mut callback) = match taken {
        Ok(it) => it,
        Err(why) => {
            tracing::debug!(message = "watch event dropped", why = why, epath = epath, token = token);
            return;
        }
    };

    tracing::debug!(message = "watch event", wpath = %wpath, epath = epath, token = token);
    callback(egc, &wpath, epath);

    let leftover = ctx.with_state(|st| match st.watches.slots.get_mut(slot) {
        Some(WatchSlot::Occupied { counter: it, cb, .. }) if *it == counter && cb.is_none() => {
            *cb = Some(callback);
            None
        }
        _ => Some(callback),
    });
    drop(leftover);
}
