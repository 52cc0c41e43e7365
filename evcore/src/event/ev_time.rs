// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc osevent

use super::{Egc, EvId, OsEventToken, RegLink};
use crate::{CoreError, CoreResult, Ctx};
use std::{collections::{BTreeSet, HashMap},
          sync::{Arc, atomic::AtomicBool},
          time::{Duration, Instant}};

/// Called once, with the deadline that was asked for.
pub type TimeCallback = Box<dyn FnOnce(&mut Egc, Instant) + Send>;

pub(crate) struct TimeReg {
    /// [`None`] is infinite: registered, but never queued.
    deadline: Option<Instant>,
    seq: u64,
    cb: Option<TimeCallback>,
    live: Arc<AtomicBool>,
}

/// Active timers, ordered by `(deadline, seq)`. `seq` is fresh for every register and
/// modify, so equal deadlines fire in the order they were last set.
#[derive(Default)]
pub(crate) struct TimerQueue {
    regs: HashMap<EvId, TimeReg>,
    queue: BTreeSet<(Instant, u64, EvId)>,
}

impl TimerQueue {
    fn insert(&mut self, id: EvId, reg: TimeReg) {
        if let Some(deadline) = reg.deadline {
            self.queue.insert((deadline, reg.seq, id));
        }
        self.regs.insert(id, reg);
    }

    fn remove(&mut self, id: EvId) -> Option<TimeReg> {
        let reg = self.regs.remove(&id)?;
        if let Some(deadline) = reg.deadline {
            self.queue.remove(&(deadline, reg.seq, id));
        }
        Some(reg)
    }

    fn reschedule(&mut self, id: EvId, deadline: Option<Instant>, seq: u64) {
        let Some(reg) = self.regs.get_mut(&id) else {
            return;
        };
        if let Some(old) = reg.deadline {
            self.queue.remove(&(old, reg.seq, id));
        }
        reg.deadline = deadline;
        reg.seq = seq;
        if let Some(deadline) = deadline {
            self.queue.insert((deadline, seq, id));
        }
    }

    fn deadline_of(&self, id: EvId) -> Option<Option<Instant>> {
        self.regs.get(&id).map(|it| it.deadline)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _, _)| *deadline)
    }

    /// Removes and returns the earliest timer due at `now`, marked dead.
    fn pop_expired(&mut self, now: Instant) -> Option<(EvId, Instant, TimeCallback)> {
        let (deadline, _, id) = *self.queue.first()?;
        if deadline > now {
            return None;
        }
        let mut reg = self.remove(id)?;
        reg.live.store(false, std::sync::atomic::Ordering::SeqCst);
        Some((id, deadline, reg.cb.take()?))
    }

    pub(crate) fn len(&self) -> usize { self.regs.len() }
}

/// A one-shot deadline. It is Idle again by the time its callback runs.
#[derive(Debug, Default)]
pub struct EvTime {
    link: Option<RegLink>,
}

impl EvTime {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Resets a handle that is not registered. Idempotent.
    pub fn init(&mut self) {
        debug_assert!(!self.is_registered(), "init of a registered EvTime");
        self.link = None;
    }

    #[must_use]
    pub fn is_registered(&self) -> bool { self.link.as_ref().is_some_and(RegLink::is_live) }

    /// # Errors
    ///
    /// [`CoreError::OseventRegFail`] if the application's hooks refuse it. The handle
    /// stays Idle.
    pub fn register_abs(
        &mut self,
        ctx: &Ctx,
        callback: impl FnOnce(&mut Egc, Instant) + Send + 'static,
        deadline: Instant,
    ) -> CoreResult<()> {
        self.register(ctx, Box::new(callback), Some(deadline))
    }

    /// `after` of [`None`] never fires, but still counts as registered.
    ///
    /// # Errors
    ///
    /// See [`register_abs()`](Self::register_abs).
    pub fn register_rel(
        &mut self,
        ctx: &Ctx,
        callback: impl FnOnce(&mut Egc, Instant) + Send + 'static,
        after: Option<Duration>,
    ) -> CoreResult<()> {
        self.register(ctx, Box::new(callback), after.map(|it| Instant::now() + it))
    }

    fn register(
        &mut self,
        ctx: &Ctx,
        callback: TimeCallback,
        deadline: Option<Instant>,
    ) -> CoreResult<()> {
        let _guard = ctx.lock();
        debug_assert!(!self.is_registered(), "EvTime registered twice");

        let (id, hooks) = ctx.with_state(|st| (st.alloc_id(), st.osevent_hooks.clone()));
        let (link, live) = RegLink::new(id);

        if let Some(deadline) = deadline
            && let Some(hooks) = &hooks
            && let Err(source) = hooks.timeout_register(deadline, OsEventToken(id))
        {
            tracing::error!(message = "ev_time register refused by hooks", error = ?source);
            return Err(CoreError::OseventRegFail {
                what: "timeout",
                source,
            });
        }

        ctx.with_state(|st| {
            st.timers.insert(
                id,
                TimeReg {
                    deadline,
                    seq: id.0,
                    cb: Some(callback),
                    live,
                },
            );
        });
        tracing::debug!(message = "ev_time register", deadline = ?deadline, id = id.0);
        self.link = Some(link);
        ctx.osevent_changed();
        Ok(())
    }

    /// # Errors
    ///
    /// [`CoreError::Invalid`] if Idle. [`CoreError::OseventRegFail`] if the hooks refuse
    /// the change, in which case the old deadline stays in force.
    pub fn modify_abs(&mut self, ctx: &Ctx, deadline: Instant) -> CoreResult<()> {
        self.modify(ctx, Some(deadline))
    }

    /// # Errors
    ///
    /// See [`modify_abs()`](Self::modify_abs).
    pub fn modify_rel(&mut self, ctx: &Ctx, after: Option<Duration>) -> CoreResult<()> {
        self.modify(ctx, after.map(|it| Instant::now() + it))
    }

    fn modify(&mut self, ctx: &Ctx, deadline: Option<Instant>) -> CoreResult<()> {
        let _guard = ctx.lock();
        let Some(link) = self.link.as_ref().filter(|it| it.is_live()) else {
            return Err(CoreError::Invalid {
                what: "modify of an unregistered timer".into(),
            });
        };
        let id = link.id;
        let token = OsEventToken(id);

        let (old, hooks) =
            ctx.with_state(|st| (st.timers.deadline_of(id), st.osevent_hooks.clone()));
        let Some(old) = old else {
            return Err(CoreError::Invalid {
                what: "modify of a timer that already fired".into(),
            });
        };

        if let Some(hooks) = hooks {
            let result = match (old, deadline) {
                (None, None) => Ok(()),
                (None, Some(new)) => hooks.timeout_register(new, token),
                (Some(_), Some(new)) => hooks.timeout_modify(token, new),
                (Some(_), None) => {
                    hooks.timeout_deregister(token);
                    Ok(())
                }
            };
            if let Err(source) = result {
                tracing::error!(message = "ev_time modify refused by hooks", error = ?source);
                return Err(CoreError::OseventRegFail {
                    what: "timeout",
                    source,
                });
            }
        }

        ctx.with_state(|st| {
            let seq = st.alloc_id().0;
            st.timers.reschedule(id, deadline, seq);
        });
        tracing::debug!(message = "ev_time modify", deadline = ?deadline, id = id.0);
        ctx.osevent_changed();
        Ok(())
    }

    /// Idempotent, and harmless after the timer has fired.
    pub fn deregister(&mut self, ctx: &Ctx) {
        let Some(link) = self.link.take() else {
            return;
        };
        if !link.kill() {
            return;
        }
        let _guard = ctx.lock();
        let (removed, hooks) =
            ctx.with_state(|st| (st.timers.remove(link.id), st.osevent_hooks.clone()));
        if let Some(reg) = &removed
            && reg.deadline.is_some()
            && let Some(hooks) = hooks
        {
            hooks.timeout_deregister(OsEventToken(link.id));
        }
        tracing::debug!(message = "ev_time deregister", id = link.id.0);
        drop(removed);
    }
}

/// Fires every timer due at `now`, earliest first. Caller holds the lock.
pub(crate) fn fire_expired_timers(egc: &mut Egc, now: Instant) {
    let ctx = egc.ctx().clone();
    loop {
        let (next, hooks) =
            ctx.with_state(|st| (st.timers.pop_expired(now), st.osevent_hooks.clone()));
        let Some((id, deadline, callback)) = next else {
            break;
        };
        if let Some(hooks) = hooks {
            hooks.timeout_deregister(OsEventToken(id));
        }
        tracing::debug!(message = "ev_time fires", id = id.0, late_by = ?now.saturating_duration_since(deadline));
        callback(egc, deadline);
    }
}

/// Fires registration `id` now, if it is still registered. For the application's
/// hooks, which own the timeout once it has been handed over.
pub(crate) fn time_occurred(egc: &mut Egc, id: EvId) {
    let ctx = egc.ctx().clone();
    let taken = ctx.with_state(|st| {
        let mut reg = st.timers.remove(id)?;
        reg.live.store(false, std::sync::atomic::Ordering::SeqCst);
        let deadline = reg.deadline?;
        Some((deadline, reg.cb.take()?))
    });
    match taken {
        Some((deadline, callback)) => callback(egc, deadline),
        None => tracing::debug!(message = "timeout occurred for unknown timer", id = id.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_fixtures::{drive_until, new_test_ctx};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> TimeCallback) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_for_cb = fired.clone();
        let make = move |name: &'static str| -> TimeCallback {
            let fired = fired_for_cb.clone();
            Box::new(move |_, _| fired.lock().unwrap().push(name))
        };
        (fired, make)
    }

    #[test]
    fn earlier_deadlines_fire_first_and_ties_keep_registration_order() {
        let (ctx, _store) = new_test_ctx();
        let (fired, make) = recorder();
        let base = Instant::now() + Duration::from_millis(50);

        let mut late = EvTime::new();
        let mut early = EvTime::new();
        let mut early_too = EvTime::new();
        late.register_abs(&ctx, make("late"), base + Duration::from_millis(40))
            .unwrap();
        early.register_abs(&ctx, make("early"), base).unwrap();
        early_too.register_abs(&ctx, make("early_too"), base).unwrap();

        assert!(drive_until(&ctx, Duration::from_secs(5), || {
            fired.lock().unwrap().len() == 3
        }));
        assert_eq!(*fired.lock().unwrap(), vec!["early", "early_too", "late"]);

        // All fired, so all are Idle, and deregistering is a no-op.
        for it in [&mut late, &mut early, &mut early_too] {
            assert!(!it.is_registered());
            it.deregister(&ctx);
        }
        assert_eq!(ctx.with_state(|st| st.timers.len()), 0);
    }

    #[test]
    fn modify_counts_as_a_fresh_registration_for_ties() {
        let (ctx, _store) = new_test_ctx();
        let (fired, make) = recorder();
        let at = Instant::now() + Duration::from_millis(30);

        let mut a = EvTime::new();
        let mut b = EvTime::new();
        a.register_abs(&ctx, make("a"), at).unwrap();
        b.register_abs(&ctx, make("b"), at).unwrap();
        a.modify_abs(&ctx, at).unwrap();

        assert!(drive_until(&ctx, Duration::from_secs(5), || {
            fired.lock().unwrap().len() == 2
        }));
        assert_eq!(*fired.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn deregistered_timer_never_fires() {
        let (ctx, _store) = new_test_ctx();
        let (fired, make) = recorder();

        let mut gone = EvTime::new();
        let mut kept = EvTime::new();
        gone.register_rel(&ctx, make("gone"), Some(Duration::from_millis(10)))
            .unwrap();
        kept.register_rel(&ctx, make("kept"), Some(Duration::from_millis(60)))
            .unwrap();
        gone.deregister(&ctx);
        gone.deregister(&ctx);
        assert!(!gone.is_registered());

        assert!(drive_until(&ctx, Duration::from_secs(5), || {
            !fired.lock().unwrap().is_empty()
        }));
        assert_eq!(*fired.lock().unwrap(), vec!["kept"]);
    }

    #[test]
    fn infinite_timer_is_registered_but_never_queued() {
        let (ctx, _store) = new_test_ctx();
        let (fired, make) = recorder();

        let mut never = EvTime::new();
        never.register_rel(&ctx, make("never"), None).unwrap();
        assert!(never.is_registered());
        assert_eq!(ctx.with_state(|st| st.timers.next_deadline()), None);

        drive_until(&ctx, Duration::from_millis(100), || false);
        assert!(fired.lock().unwrap().is_empty());

        never
            .modify_rel(&ctx, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(5), || {
            !fired.lock().unwrap().is_empty()
        }));
        assert!(!never.is_registered());
    }
}
