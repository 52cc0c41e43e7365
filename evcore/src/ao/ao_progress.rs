// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc aop

use super::Ao;
use crate::{Ctx, Egc, Event};
use std::{fmt, sync::Arc};

/// Called for each progress report, with the context lock released.
pub type AoProgressCallback = Arc<dyn Fn(&Ctx, Event) + Send + Sync>;

/// How the caller of a slow operation wants to hear about its progress.
#[derive(Clone, Default)]
pub enum AsyncprogressHow {
    #[default]
    Ignore,
    Callback(AoProgressCallback),
    /// Raise the report as an ordinary event, with `for_user` set to `for_event`.
    Event { for_event: u64 },
}

impl AsyncprogressHow {
    /// What the operation should do, given what (if anything) the caller asked for.
    #[must_use]
    pub fn gethow(from_app: Option<&AsyncprogressHow>) -> Self {
        from_app.cloned().unwrap_or_default()
    }
}

impl fmt::Debug for AsyncprogressHow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncprogressHow::Ignore => f.write_str("Ignore"),
            AsyncprogressHow::Callback(_) => f.write_str("Callback"),
            AsyncprogressHow::Event { for_event } => {
                f.debug_struct("Event").field("for_event", for_event).finish()
            }
        }
    }
}

/// A progress report waiting on an egc to be delivered.
pub struct AoProgress {
    ao: Ao,
    event: Event,
    callback: AoProgressCallback,
}

impl fmt::Debug for AoProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AoProgress")
            .field("ao", &self.ao)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

impl Ao {
    /// Reports `event` as progress of this operation. With a callback, the operation's
    /// completion is held back until the report has been delivered. Call with the
    /// context lock held.
    pub fn progress_report(&self, egc: &mut Egc, how: &AsyncprogressHow, mut event: Event) {
        if !self.check_magic("progress_report") {
            return;
        }
        match how {
            AsyncprogressHow::Ignore => {
                tracing::trace!(message = "progress report ignored", event = ?event);
            }
            AsyncprogressHow::Callback(callback) => {
                self.state().progress_reports_outstanding += 1;
                egc.queue_aop(AoProgress {
                    ao: self.clone(),
                    event,
                    callback: callback.clone(),
                });
            }
            AsyncprogressHow::Event { for_event } => {
                event.for_user = *for_event;
                egc.event_occurred(event);
            }
        }
    }
}

impl AoProgress {
    /// Runs the callback, then lets the operation's completion through if this was the
    /// last report it was waiting for. From egc teardown, with the lock released.
    pub(crate) fn deliver(self, egc: &mut Egc) {
        let Self {
            ao,
            event,
            callback,
        } = self;
        callback(egc.ctx(), event);

        let ctx = egc.ctx().clone();
        let _guard = ctx.lock();
        {
            let mut st = ao.state();
            debug_assert!(st.progress_reports_outstanding > 0);
            st.progress_reports_outstanding = st.progress_reports_outstanding.saturating_sub(1);
        }
        ao.complete_check_progress_reports(egc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AoResult, AsyncopHow, EventKind, EventMask,
                core::test_fixtures::new_test_ctx};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Progress(String),
        Done(AoResult),
    }

    fn observed(value: &str) -> Event {
        Event::new(
            2,
            0,
            EventKind::StateObserved {
                path: "/x".into(),
                value: value.into(),
            },
        )
    }

    #[test]
    fn gethow_defaults_to_ignore() {
        assert!(matches!(AsyncprogressHow::gethow(None), AsyncprogressHow::Ignore));
        let how = AsyncprogressHow::Event { for_event: 3 };
        assert!(matches!(
            AsyncprogressHow::gethow(Some(&how)),
            AsyncprogressHow::Event { for_event: 3 }
        ));
    }

    #[test]
    fn completion_waits_for_outstanding_reports() {
        let (ctx, _store) = new_test_ctx();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_done = seen.clone();
        let ao = Ao::new(
            2,
            Some(AsyncopHow::Callback(Box::new(move |_, rc| {
                seen_done.lock().unwrap().push(Seen::Done(rc));
            }))),
            None,
        );
        {
            let mut st = ao.state();
            st.constructing = false;
            st.in_initiator = false;
        }
        let seen_progress = seen.clone();
        let how = AsyncprogressHow::Callback(Arc::new(move |_, event| {
            if let EventKind::StateObserved { value, .. } = event.kind {
                seen_progress.lock().unwrap().push(Seen::Progress(value));
            }
        }));

        {
            let mut egc = Egc::new(&ctx);
            let _guard = ctx.lock();
            ao.progress_report(&mut egc, &how, observed("1"));
            ao.progress_report(&mut egc, &how, observed("2"));
            ao.complete(&mut egc, Ok(()));
            // Held back behind the two reports.
            assert!(egc.aos_for_callback.is_empty());
            assert_eq!(ao.state().progress_reports_outstanding, 2);
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Seen::Progress("1".into()),
                Seen::Progress("2".into()),
                Seen::Done(Ok(())),
            ]
        );
        assert!(ao.is_destroyed());
    }

    #[test]
    fn event_style_reports_carry_for_event() {
        let (ctx, _store) = new_test_ctx();
        let ao = Ao::new(2, Some(AsyncopHow::Event { for_event: 1 }), None);
        let how = AsyncprogressHow::Event { for_event: 99 };
        {
            let mut egc = Egc::new(&ctx);
            let _guard = ctx.lock();
            ao.progress_report(&mut egc, &how, observed("3"));
            ao.progress_report(&mut egc, &AsyncprogressHow::Ignore, observed("4"));
        }
        let event = ctx.event_check(EventMask::all(), None).unwrap();
        assert_eq!(event.for_user, 99);
        assert_eq!(ctx.event_check(EventMask::all(), None), None);
        assert_eq!(ao.state().progress_reports_outstanding, 0);
    }
}
