// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc domid devstate inprogress

use super::EvDevstate;
use crate::{AoOp, AoResult, AsyncopHow, AsyncprogressHow, Ctx, Egc, Event, EventKind};
use std::time::Duration;

/// Slow operation: waits until the store `path` reads as the integer `wanted`.
///
/// With `ao_how` of [`None`] the call blocks until the outcome is known and returns it.
/// Otherwise it returns `Ok(())` once the wait is set up, and the outcome arrives as
/// `ao_how` says. Every other value seen at `path` in the meantime is reported as an
/// [`EventKind::StateObserved`] progress event, as `progress_how` says.
///
/// The outcomes are those of [`EvDevstate`].
///
/// # Errors
///
/// [`ErrorCode::Fail`](crate::ErrorCode::Fail) if the context is poisoned, or the
/// error code of whatever part of the setup failed.
pub fn await_path_state(
    ctx: &Ctx,
    domid: u32,
    path: &str,
    wanted: i32,
    timeout: Option<Duration>,
    ao_how: Option<AsyncopHow>,
    progress_how: Option<&AsyncprogressHow>,
) -> AoResult {
    let op = AoOp::create(ctx, domid, ao_how).map_err(|err| err.code())?;
    let ao = op.ao().clone();
    let progress_how = AsyncprogressHow::gethow(progress_how);

    let devstate = EvDevstate::new();
    if !matches!(progress_how, AsyncprogressHow::Ignore) {
        let ao = ao.clone();
        let path = path.to_string();
        devstate.set_observer(move |egc, value| {
            let event = Event::new(
                domid,
                0,
                EventKind::StateObserved {
                    path: path.clone(),
                    value: value.to_string(),
                },
            );
            ao.progress_report(egc, &progress_how, event);
        });
    }

    let on_done = {
        let ao = ao.clone();
        move |egc: &mut Egc, rc: AoResult| ao.complete(egc, rc)
    };
    if let Err(err) = devstate.wait(op.ctx(), on_done, path, wanted, timeout) {
        tracing::error!(message = "await_path_state setup failed", path = path, error = ?err);
        return Err(op.abort(err.code()));
    }

    // Lives, and keeps waiting, as long as the operation does.
    ao.with_gc(|gc| {
        let _ = gc.alloc(devstate);
    });
    op.inprogress()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigStore as _, ErrorCode,
                core::test_fixtures::new_test_ctx};
    use pretty_assertions::assert_eq;
    use std::{thread, time::Duration};

    #[test]
    fn synchronous_wait_returns_when_another_thread_writes() {
        let (ctx, store) = new_test_ctx();
        store.write("/local/domain/0/backend/vbd/3/768/state", "2").unwrap();
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                store
                    .write("/local/domain/0/backend/vbd/3/768/state", "4")
                    .unwrap();
            })
        };
        let rc = await_path_state(
            &ctx,
            3,
            "/local/domain/0/backend/vbd/3/768/state",
            4,
            Some(Duration::from_secs(5)),
            None,
            None,
        );
        writer.join().unwrap();
        assert_eq!(rc, Ok(()));
        assert_eq!(store.watch_count(), 0);
        assert!(!ctx.is_locked_by_current_thread());
    }

    #[test]
    fn synchronous_wait_times_out() {
        let (ctx, store) = new_test_ctx();
        store.write("/be/state", "1").unwrap();
        let rc = await_path_state(
            &ctx,
            1,
            "/be/state",
            4,
            Some(Duration::from_millis(30)),
            None,
            None,
        );
        assert_eq!(rc, Err(ErrorCode::TimedOut));
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn poisoned_ctx_fails_at_once() {
        let (ctx, _store) = new_test_ctx();
        ctx.poison();
        let rc = await_path_state(&ctx, 1, "/be/state", 4, None, None, None);
        assert_eq!(rc, Err(ErrorCode::Fail));
    }
}
