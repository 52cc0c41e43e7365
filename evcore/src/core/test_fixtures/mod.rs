// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc

//! Shared helpers for unit tests.

// Attach sources.
pub mod temp_dir;

// Re-export.
pub use temp_dir::*;

use crate::{Ctx, CtxConfig, Egc, EvTime, Event, EventHooks, EventMask, EventType, MemStore,
            eventloop_iteration};
use std::{os::fd::OwnedFd,
          sync::{Arc, Mutex,
                 atomic::{AtomicBool, Ordering}},
          time::Duration};

/// A fresh context on its own in-memory store.
pub fn new_test_ctx() -> (Ctx, Arc<MemStore>) {
    let store = Arc::new(MemStore::try_new().unwrap());
    let ctx = Ctx::new(CtxConfig::new(store.clone())).unwrap();
    (ctx, store)
}

/// `(read end, write end)`.
pub fn pipe_pair() -> (OwnedFd, OwnedFd) { rustix::pipe::pipe().unwrap() }

/// Runs the event loop on this thread until `done()` (checked with the lock released)
/// returns true, or `timeout` passes. Returns whether `done()` was reached.
pub fn drive_until(ctx: &Ctx, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let expired = Arc::new(AtomicBool::new(false));
    let mut watchdog = EvTime::new();
    let expired_cb = expired.clone();
    watchdog
        .register_rel(
            ctx,
            move |_, _| expired_cb.store(true, Ordering::SeqCst),
            Some(timeout),
        )
        .unwrap();

    let mut poller = ctx.poller_get().unwrap();
    let mut guard = ctx.lock();
    let reached = loop {
        if guard.unlocked(&mut done) {
            break true;
        }
        if expired.load(Ordering::SeqCst) {
            break false;
        }
        let mut egc = Egc::new(ctx);
        eventloop_iteration(&mut egc, &mut guard, &mut poller).unwrap();
        guard.unlocked(|| drop(egc));
    };
    drop(guard);
    ctx.poller_put(poller);
    watchdog.deregister(ctx);
    reached
}

/// Event hooks that remember what they were given.
#[derive(Debug)]
pub struct RecordingEventHooks {
    mask: EventMask,
    events: Mutex<Vec<Event>>,
    disasters: Mutex<Vec<(String, i32)>>,
    lock_held: AtomicBool,
}

impl RecordingEventHooks {
    pub fn new(mask: EventMask) -> Self {
        Self {
            mask,
            events: Mutex::default(),
            disasters: Mutex::default(),
            lock_held: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> Vec<Event> { self.events.lock().unwrap().clone() }

    pub fn disasters(&self) -> Vec<(String, i32)> { self.disasters.lock().unwrap().clone() }

    /// Whether any event was delivered while the delivering thread held the ctx lock.
    pub fn saw_lock_held(&self) -> bool { self.lock_held.load(Ordering::SeqCst) }
}

impl EventHooks for RecordingEventHooks {
    fn event_occurs_mask(&self) -> EventMask { self.mask }

    fn event_occurs(&self, ctx: &Ctx, event: Event) {
        if ctx.is_locked_by_current_thread() {
            self.lock_held.store(true, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
    }

    fn disaster(&self, _ctx: &Ctx, _event_type: Option<EventType>, msg: &str, errno: i32) {
        self.disasters.lock().unwrap().push((msg.to_string(), errno));
    }
}
