// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc aops

use super::Event;
use crate::{Ao, AoProgress, Ctx, Pool};
use std::{collections::VecDeque, fmt, marker::PhantomData};

/// Event generation context: collects what one entry into the library has to tell the
/// application, and tells it once the entry is over.
///
/// Create it before taking the [`Ctx`] lock, and let it drop after the lock has been
/// released. Dropping it delivers, in this order and until nothing is left:
///
/// 1. completed [`Ao`]s to their completion callbacks;
/// 2. [`Event`]s to [`EventHooks::event_occurs()`];
/// 3. progress reports to their callbacks.
///
/// Delivery can queue more work on the same egc (a progress report being acknowledged
/// lets its operation's completion through), which is why it loops. The scratch pool is
/// freed last.
///
/// An egc belongs to the thread that made it.
///
/// [`EventHooks::event_occurs()`]: super::EventHooks::event_occurs
pub struct Egc {
    ctx: Ctx,
    gc: Pool,
    pub(crate) aos_for_callback: VecDeque<Ao>,
    pub(crate) occurred_for_callback: VecDeque<Event>,
    pub(crate) aops_for_callback: VecDeque<AoProgress>,
    _not_send: PhantomData<*const ()>,
}

impl Egc {
    #[must_use]
    pub fn new(ctx: &Ctx) -> Self {
        Self {
            ctx: ctx.clone(),
            gc: Pool::new(),
            aos_for_callback: VecDeque::new(),
            occurred_for_callback: VecDeque::new(),
            aops_for_callback: VecDeque::new(),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn ctx(&self) -> &Ctx { &self.ctx }

    /// Scratch allocations that live until this egc is dropped.
    #[must_use]
    pub fn gc(&self) -> &Pool { &self.gc }

    pub(crate) fn queue_ao(&mut self, ao: Ao) { self.aos_for_callback.push_back(ao); }

    pub(crate) fn queue_aop(&mut self, aop: AoProgress) { self.aops_for_callback.push_back(aop); }

    fn deliver_one(&mut self) -> bool {
        if let Some(ao) = self.aos_for_callback.pop_front() {
            ao.deliver_completion(self);
            return true;
        }
        if let Some(event) = self.occurred_for_callback.pop_front() {
            let ctx = self.ctx.clone();
            match ctx.with_state(|st| st.event_hooks.clone()) {
                Some(hooks) => hooks.event_occurs(&ctx, event),
                // Hooks went away since it was queued.
                None => ctx.event_queue_push(event),
            }
            return true;
        }
        if let Some(aop) = self.aops_for_callback.pop_front() {
            aop.deliver(self);
            return true;
        }
        false
    }
}

impl Drop for Egc {
    fn drop(&mut self) {
        while self.deliver_one() {}
        self.gc.free_all();
    }
}

impl fmt::Debug for Egc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Egc")
            .field("aos", &self.aos_for_callback.len())
            .field("events", &self.occurred_for_callback.len())
            .field("aops", &self.aops_for_callback.len())
            .field("gc", &self.gc.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, EventMask,
                core::test_fixtures::{RecordingEventHooks, new_test_ctx}};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn events_are_delivered_on_drop_unlocked() {
        let (ctx, _store) = new_test_ctx();
        let hooks = Arc::new(RecordingEventHooks::new(EventMask::all()));
        ctx.event_register_callbacks(Some(hooks.clone()));

        {
            let mut egc = Egc::new(&ctx);
            let _guard = ctx.lock();
            egc.event_occurred(Event::new(1, 10, EventKind::DomainDeath));
            egc.event_occurred(Event::new(2, 20, EventKind::DomainDeath));
            assert!(hooks.events().is_empty());
        }

        let seen = hooks.events();
        assert_eq!(
            seen.iter().map(|it| it.for_user).collect::<Vec<_>>(),
            vec![10, 20]
        );
        assert!(!hooks.saw_lock_held());
    }

    #[test]
    fn gc_is_freed_on_drop() {
        let (ctx, _store) = new_test_ctx();
        let egc = Egc::new(&ctx);
        let _ = egc.gc().strdup("scratch");
        let _ = egc.gc().alloc(5_u64);
        assert_eq!(egc.gc().len(), 2);
        drop(egc);
    }
}
