// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc errno

use super::{Egc, Event, EventMask, EventType, eventloop_iteration};
use crate::{CoreResult, Ctx};
use std::collections::VecDeque;

/// How the application hears about [`Event`]s.
///
/// Events whose type is in [`event_occurs_mask()`](Self::event_occurs_mask) go to
/// [`event_occurs()`](Self::event_occurs), with the context lock released. All others
/// are queued on the context, for [`Ctx::event_check()`] and [`Ctx::event_wait()`].
pub trait EventHooks: Send + Sync {
    fn event_occurs_mask(&self) -> EventMask { EventMask::all() }

    fn event_occurs(&self, ctx: &Ctx, event: Event);

    /// The event machinery failed in a way it can't recover from. The context is
    /// poisoned by the time this runs: no new operation can be started on it. Called
    /// with the lock held, so it must not call back into the library.
    fn disaster(&self, _ctx: &Ctx, _event_type: Option<EventType>, _msg: &str, _errno: i32) {}
}

/// Events nobody has a hook for, oldest first.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    queue: VecDeque<(u64, Event)>,
    next_seq: u64,
}

impl EventQueue {
    fn push(&mut self, event: Event) {
        self.next_seq += 1;
        self.queue.push_back((self.next_seq, event));
    }

    fn snapshot(&self) -> Vec<(u64, Event)> { self.queue.iter().cloned().collect() }

    fn remove(&mut self, seq: u64) -> Option<Event> {
        let index = self.queue.iter().position(|(it, _)| *it == seq)?;
        self.queue.remove(index).map(|(_, event)| event)
    }

    pub(crate) fn len(&self) -> usize { self.queue.len() }
}

impl Egc {
    /// Routes `event` to the application: to the hooks when this egc is dropped if they
    /// want its type, otherwise onto the context's queue right away.
    pub fn event_occurred(&mut self, event: Event) {
        let ctx = self.ctx().clone();
        let wanted = ctx
            .with_state(|st| st.event_hooks.clone())
            .is_some_and(|hooks| hooks.event_occurs_mask().contains(event.event_type()));
        tracing::debug!(message = "event occurred", event = ?event, for_hooks = wanted);
        if wanted {
            self.occurred_for_callback.push_back(event);
        } else {
            ctx.event_queue_push(event);
        }
    }

    /// Reports an unrecoverable failure in the event machinery and poisons the context.
    /// The process keeps running; operations already in flight may never complete.
    pub fn event_disaster(&mut self, msg: &str, errno: i32, event_type: Option<EventType>) {
        let ctx = self.ctx().clone();
        tracing::error!(
            message = "event loop disaster",
            what = msg,
            errno = errno,
            event_type = ?event_type
        );
        ctx.poison();
        match ctx.with_state(|st| st.event_hooks.clone()) {
            Some(hooks) => hooks.disaster(&ctx, event_type, msg, errno),
            None => tracing::error!(
                message = "disaster not caught by any event hooks, context is unusable",
                what = msg
            ),
        }
    }
}

impl Ctx {
    pub(crate) fn event_queue_push(&self, event: Event) {
        self.with_state(|st| st.events.push(event));
        self.pollers_event_wake();
    }

    /// Takes the oldest queued event whose type is in `mask` and which `predicate`
    /// accepts. The predicate runs with the lock held.
    pub fn event_check(
        &self,
        mask: EventMask,
        predicate: Option<&dyn Fn(&Event) -> bool>,
    ) -> Option<Event> {
        let _guard = self.lock();
        let snapshot = self.with_state(|st| st.events.snapshot());
        let seq = snapshot
            .iter()
            .find(|(_, event)| {
                mask.contains(event.event_type()) && predicate.is_none_or(|it| it(event))
            })
            .map(|(seq, _)| *seq)?;
        self.with_state(|st| st.events.remove(seq))
    }

    /// Like [`event_check()`](Self::event_check), but runs the event loop until a
    /// matching event turns up.
    ///
    /// # Errors
    ///
    /// If a poller can't be set up, or `poll(2)` fails.
    pub fn event_wait(
        &self,
        mask: EventMask,
        predicate: Option<&dyn Fn(&Event) -> bool>,
    ) -> CoreResult<Event> {
        let mut guard = self.lock();
        let mut poller = self.poller_get()?;
        self.pollers_event_add(&poller);

        let result = loop {
            if let Some(event) = self.event_check(mask, predicate) {
                break Ok(event);
            }
            let mut egc = Egc::new(self);
            let iteration = eventloop_iteration(&mut egc, &mut guard, &mut poller);
            guard.unlocked(|| drop(egc));
            if let Err(err) = iteration {
                tracing::error!(message = "event_wait failed", error = ?err);
                break Err(err);
            }
        };

        self.pollers_event_remove(&poller);
        self.poller_put(poller);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvTime, EventKind,
                core::test_fixtures::{RecordingEventHooks, new_test_ctx}};
    use pretty_assertions::assert_eq;
    use std::{sync::Arc, thread, time::Duration};

    fn raise(ctx: &Ctx, event: Event) {
        let mut egc = Egc::new(ctx);
        let guard = ctx.lock();
        egc.event_occurred(event);
        drop(guard);
    }

    #[test]
    fn without_hooks_events_queue_on_the_context() {
        let (ctx, _store) = new_test_ctx();
        raise(&ctx, Event::new(1, 0, EventKind::DomainDeath));
        raise(&ctx, Event::new(2, 0, EventKind::DomainShutdown { shutdown_reason: 3 }));
        raise(&ctx, Event::new(3, 0, EventKind::DomainDeath));
        assert_eq!(ctx.with_state(|st| st.events.len()), 3);

        let only_shutdowns = EventMask::of(&[EventType::DomainShutdown]);
        assert_eq!(ctx.event_check(only_shutdowns, None).map(|it| it.domid), Some(2));
        assert_eq!(ctx.event_check(only_shutdowns, None), None);

        let dom3: &dyn Fn(&Event) -> bool = &|it| it.domid == 3;
        assert_eq!(
            ctx.event_check(EventMask::all(), Some(dom3)).map(|it| it.domid),
            Some(3)
        );
        assert_eq!(ctx.event_check(EventMask::all(), None).map(|it| it.domid), Some(1));
        assert_eq!(ctx.with_state(|st| st.events.len()), 0);
    }

    #[test]
    fn hooks_get_masked_types_and_the_rest_queue() {
        let (ctx, _store) = new_test_ctx();
        let hooks = Arc::new(RecordingEventHooks::new(EventMask::of(&[
            EventType::DiskEject,
        ])));
        ctx.event_register_callbacks(Some(hooks.clone()));

        raise(&ctx, Event::new(1, 0, EventKind::DiskEject { vdev: "hdc".into() }));
        raise(&ctx, Event::new(1, 0, EventKind::DomainDeath));

        assert_eq!(hooks.events().len(), 1);
        assert_eq!(hooks.events()[0].event_type(), EventType::DiskEject);
        assert_eq!(
            ctx.event_check(EventMask::all(), None).map(|it| it.event_type()),
            Some(EventType::DomainDeath)
        );
    }

    #[test]
    fn event_wait_blocks_until_an_event_is_raised() {
        let (ctx, _store) = new_test_ctx();
        let raiser = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                raise(&ctx, Event::new(7, 42, EventKind::DomainDeath));
            })
        };
        let event = ctx.event_wait(EventMask::all(), None).unwrap();
        assert_eq!(event.for_user, 42);
        raiser.join().unwrap();
        assert_eq!(ctx.with_state(|st| st.pollers.idle_count()), 1);
    }

    #[test]
    fn event_wait_runs_timers_while_waiting() {
        let (ctx, _store) = new_test_ctx();
        let mut timer = EvTime::new();
        timer
            .register_rel(
                &ctx,
                |egc, _| egc.event_occurred(Event::new(0, 1, EventKind::DomainDeath)),
                Some(Duration::from_millis(20)),
            )
            .unwrap();
        let event = ctx.event_wait(EventMask::all(), None).unwrap();
        assert_eq!(event.for_user, 1);
    }

    #[test]
    fn disaster_poisons_and_reaches_the_hook() {
        let (ctx, _store) = new_test_ctx();
        let hooks = Arc::new(RecordingEventHooks::new(EventMask::all()));
        ctx.event_register_callbacks(Some(hooks.clone()));

        let mut egc = Egc::new(&ctx);
        egc.event_disaster("cannot read the store", libc::EIO, None);
        assert!(ctx.is_poisoned());
        assert_eq!(hooks.disasters(), vec![("cannot read the store".to_string(), libc::EIO)]);
    }

    #[test]
    fn disaster_without_hooks_still_poisons() {
        let (ctx, _store) = new_test_ctx();
        let mut egc = Egc::new(&ctx);
        egc.event_disaster("boom", libc::EBADF, Some(EventType::DomainDeath));
        assert!(ctx.is_poisoned());
    }
}
