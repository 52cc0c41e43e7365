// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc devstate

use crate::{AoResult, CoreResult, Ctx, Egc, ErrorCode, EvTime, EvWatch};
use parking_lot::Mutex;
use std::{fmt,
          sync::{Arc, Weak},
          time::Duration};

/// Called once with the outcome, with the context lock held.
pub type DevstateCallback = Box<dyn FnOnce(&mut Egc, AoResult) + Send>;

/// Called with each value seen at the path that isn't the wanted state yet.
pub type DevstateObserver = Box<dyn FnMut(&mut Egc, &str) + Send>;

/// Waits for a store path to hold a given integer state.
///
/// | Outcome                  | When                                       |
/// | :----------------------- | :----------------------------------------- |
/// | `Ok(())`                 | the path reads as the wanted state         |
/// | [`ErrorCode::Inval`]     | the path doesn't exist, or was removed     |
/// | [`ErrorCode::Fail`]      | the path can't be read                     |
/// | [`ErrorCode::TimedOut`]  | the timeout passed first                   |
///
/// Values that don't parse as an integer are treated like any other wrong state: the
/// waiter keeps waiting. Dropping a waiter that is still waiting cancels it.
#[derive(Default)]
pub struct EvDevstate {
    inner: Arc<Mutex<DevstateInner>>,
}

#[derive(Default)]
struct DevstateInner {
    watch: EvWatch,
    timeout: EvTime,
    wanted: i32,
    callback: Option<DevstateCallback>,
    observer: Option<DevstateObserver>,
    /// Set while waiting.
    ctx: Option<Ctx>,
}

impl EvDevstate {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn is_waiting(&self) -> bool { self.inner.lock().callback.is_some() }

    /// Installs an observer for intermediate values. It stays for later waits.
    pub fn set_observer(&self, observer: impl FnMut(&mut Egc, &str) + Send + 'static) {
        self.inner.lock().observer = Some(Box::new(observer));
    }

    /// Starts waiting for `path` to read as `wanted`. A `timeout` of [`None`] waits
    /// forever.
    ///
    /// # Errors
    ///
    /// If the watch or the timer can't be registered. Nothing is left registered.
    pub fn wait(
        &self,
        ctx: &Ctx,
        callback: impl FnOnce(&mut Egc, AoResult) + Send + 'static,
        path: &str,
        wanted: i32,
        timeout: Option<Duration>,
    ) -> CoreResult<()> {
        let _guard = ctx.lock();
        let mut inner = self.inner.lock();
        debug_assert!(inner.callback.is_none(), "EvDevstate is already waiting");

        let weak = Arc::downgrade(&self.inner);
        let on_timeout = {
            let weak = weak.clone();
            let path = path.to_string();
            move |egc: &mut Egc, _| {
                tracing::error!(message = "timed out waiting for device state", path = %path);
                finish(egc, &weak, Err(ErrorCode::TimedOut));
            }
        };
        inner.timeout.register_rel(ctx, on_timeout, timeout)?;

        let on_watch = move |egc: &mut Egc, wpath: &str, _epath: &str| {
            watch_fired(egc, &weak, wpath);
        };
        if let Err(err) = inner.watch.register(ctx, on_watch, path) {
            inner.timeout.deregister(ctx);
            return Err(err);
        }

        tracing::debug!(message = "devstate wait", path = path, wanted = wanted, timeout = ?timeout);
        inner.wanted = wanted;
        inner.callback = Some(Box::new(callback));
        inner.ctx = Some(ctx.clone());
        Ok(())
    }

    /// Stops waiting without calling the callback. Idempotent.
    pub fn cancel(&self, ctx: &Ctx) {
        let _guard = ctx.lock();
        let leftovers = {
            let mut inner = self.inner.lock();
            inner.watch.deregister(ctx);
            inner.timeout.deregister(ctx);
            inner.ctx = None;
            inner.callback.take()
        };
        drop(leftovers);
    }
}

impl Drop for EvDevstate {
    fn drop(&mut self) {
        let ctx = self.inner.lock().ctx.take();
        if let Some(ctx) = ctx {
            self.cancel(&ctx);
        }
    }
}

impl fmt::Debug for EvDevstate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EvDevstate")
            .field("path", &inner.watch.path())
            .field("wanted", &inner.wanted)
            .field("waiting", &inner.callback.is_some())
            .finish()
    }
}

fn watch_fired(egc: &mut Egc, weak: &Weak<Mutex<DevstateInner>>, wpath: &str) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let wanted = inner.lock().wanted;
    let value = match egc.ctx().store().read(wpath) {
        Ok(Some(value)) => value,
        Ok(None) => {
            tracing::warn!(message = "device state path was removed", path = wpath, wanted = wanted);
            finish(egc, weak, Err(ErrorCode::Inval));
            return;
        }
        Err(err) => {
            tracing::error!(message = "unable to read device state", path = wpath, error = ?err);
            finish(egc, weak, Err(ErrorCode::Fail));
            return;
        }
    };

    match value.trim().parse::<i32>() {
        Ok(got) if got == wanted => {
            tracing::debug!(message = "device state reached", path = wpath, state = got);
            finish(egc, weak, Ok(()));
        }
        parsed => {
            tracing::debug!(
                message = "device state not yet as wanted",
                path = wpath,
                value = %value,
                wanted = wanted,
                parsed = ?parsed.ok()
            );
            observe(egc, &inner, &value);
        }
    }
}

/// Runs the observer outside the waiter's own lock, so it may look at the waiter.
fn observe(egc: &mut Egc, inner: &Arc<Mutex<DevstateInner>>, value: &str) {
    let Some(mut observer) = inner.lock().observer.take() else {
        return;
    };
    observer(egc, value);
    let mut inner = inner.lock();
    if inner.observer.is_none() {
        inner.observer = Some(observer);
    }
}

fn finish(egc: &mut Egc, weak: &Weak<Mutex<DevstateInner>>, rc: AoResult) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let ctx = egc.ctx().clone();
    let callback = {
        let mut inner = inner.lock();
        inner.watch.deregister(&ctx);
        inner.timeout.deregister(&ctx);
        inner.ctx = None;
        inner.callback.take()
    };
    if let Some(callback) = callback {
        callback(egc, rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigStore as _,
                core::test_fixtures::{drive_until, new_test_ctx}};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    type Outcomes = Arc<StdMutex<Vec<AoResult>>>;

    fn recorder() -> (Outcomes, impl FnOnce(&mut Egc, AoResult) + Send + 'static) {
        let outcomes: Outcomes = Arc::default();
        let outcomes_cb = outcomes.clone();
        (outcomes, move |_: &mut Egc, rc| outcomes_cb.lock().unwrap().push(rc))
    }

    #[test]
    fn completes_when_the_state_is_reached() {
        let (ctx, store) = new_test_ctx();
        store.write("/be/1/state", "1").unwrap();
        let devstate = EvDevstate::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        devstate.set_observer(move |_, value| seen_cb.lock().unwrap().push(value.to_string()));

        let (outcomes, callback) = recorder();
        devstate
            .wait(&ctx, callback, "/be/1/state", 4, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(devstate.is_waiting());

        assert!(drive_until(&ctx, Duration::from_secs(2), || !seen.lock().unwrap().is_empty()));
        store.write("/be/1/state", "banana").unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(2), || seen.lock().unwrap().len() == 2));
        store.write("/be/1/state", "4").unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(2), || !outcomes.lock().unwrap().is_empty()));

        assert_eq!(*outcomes.lock().unwrap(), vec![Ok(())]);
        assert_eq!(*seen.lock().unwrap(), vec!["1".to_string(), "banana".to_string()]);
        assert!(!devstate.is_waiting());
        assert_eq!(store.watch_count(), 0);
        assert_eq!(ctx.with_state(|st| st.timers.len()), 0);
    }

    #[test]
    fn absent_path_is_inval() {
        let (ctx, _store) = new_test_ctx();
        let devstate = EvDevstate::new();
        let (outcomes, callback) = recorder();
        devstate.wait(&ctx, callback, "/be/missing", 4, None).unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(2), || !outcomes.lock().unwrap().is_empty()));
        assert_eq!(*outcomes.lock().unwrap(), vec![Err(ErrorCode::Inval)]);
    }

    #[test]
    fn unreadable_path_is_fail() {
        let (ctx, store) = new_test_ctx();
        store.write("/be/2/state", "1").unwrap();
        store.set_unreadable("/be/2/state");
        let devstate = EvDevstate::new();
        let (outcomes, callback) = recorder();
        devstate.wait(&ctx, callback, "/be/2/state", 4, None).unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(2), || !outcomes.lock().unwrap().is_empty()));
        assert_eq!(*outcomes.lock().unwrap(), vec![Err(ErrorCode::Fail)]);
    }

    #[test]
    fn times_out_once() {
        let (ctx, store) = new_test_ctx();
        store.write("/be/3/state", "1").unwrap();
        let devstate = EvDevstate::new();
        let (outcomes, callback) = recorder();
        devstate
            .wait(&ctx, callback, "/be/3/state", 4, Some(Duration::from_millis(30)))
            .unwrap();
        assert!(drive_until(&ctx, Duration::from_secs(2), || !outcomes.lock().unwrap().is_empty()));
        // A late change is no longer watched.
        store.write("/be/3/state", "4").unwrap();
        drive_until(&ctx, Duration::from_millis(50), || false);
        assert_eq!(*outcomes.lock().unwrap(), vec![Err(ErrorCode::TimedOut)]);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn cancel_and_drop_release_everything_without_calling_back() {
        let (ctx, store) = new_test_ctx();
        store.write("/be/4/state", "1").unwrap();

        let devstate = EvDevstate::new();
        let (outcomes, callback) = recorder();
        devstate.wait(&ctx, callback, "/be/4/state", 4, None).unwrap();
        devstate.cancel(&ctx);
        devstate.cancel(&ctx);
        assert!(!devstate.is_waiting());

        let dropped = EvDevstate::new();
        let (dropped_outcomes, callback) = recorder();
        dropped.wait(&ctx, callback, "/be/4/state", 4, None).unwrap();
        assert_eq!(store.watch_count(), 1);
        drop(dropped);

        store.write("/be/4/state", "4").unwrap();
        drive_until(&ctx, Duration::from_millis(50), || false);
        assert!(outcomes.lock().unwrap().is_empty());
        assert!(dropped_outcomes.lock().unwrap().is_empty());
        assert_eq!(store.watch_count(), 0);
    }
}
