// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc domid

use crate::{AoResult, Ctx, Egc, Event, EventKind, Pool, PollerWakeup, rc_of};
use parking_lot::{Mutex, MutexGuard};
use std::{fmt,
          sync::{Arc,
                 atomic::{AtomicU32, Ordering}}};

pub(crate) const AO_MAGIC: u32 = 0xA0FA_CE00;
pub(crate) const AO_MAGIC_DESTROYED: u32 = 0xA0DE_AD00;

/// Called once with the final result, with the context lock released.
pub type AoCallback = Box<dyn FnOnce(&Ctx, AoResult) + Send>;

/// How the caller of a slow operation wants to hear that it finished. Passing no
/// `AsyncopHow` at all makes the operation synchronous.
pub enum AsyncopHow {
    Callback(AoCallback),
    /// Raise an [`EventKind::OperationComplete`] event carrying `for_event`.
    Event { for_event: u64 },
}

impl fmt::Debug for AsyncopHow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncopHow::Callback(_) => f.write_str("Callback"),
            AsyncopHow::Event { for_event } => {
                f.debug_struct("Event").field("for_event", for_event).finish()
            }
        }
    }
}

/// One slow operation in flight. Clones refer to the same operation.
///
/// Sub-operations hold a clone in their callbacks and call [`complete()`] once the
/// outcome is known. Starting and finishing the initiating call is [`AoOp`]'s job.
///
/// [`AoOp`]: crate::AoOp
/// [`complete()`]: Self::complete
#[derive(Clone)]
pub struct Ao {
    inner: Arc<AoInner>,
}

struct AoInner {
    magic: AtomicU32,
    domid: u32,
    state: Mutex<AoState>,
}

pub(crate) struct AoState {
    /// Until the initiating call has finished setting up.
    pub(crate) constructing: bool,
    /// Until the initiating call has returned to its caller.
    pub(crate) in_initiator: bool,
    pub(crate) complete: bool,
    /// The caller has been told the result.
    pub(crate) notified: bool,
    /// Sits on some egc's completion queue.
    queued_for_callback: bool,
    pub(crate) progress_reports_outstanding: u32,
    pub(crate) rc: AoResult,
    /// [`None`] for a synchronous operation.
    how: Option<AsyncopHow>,
    /// Synchronous operations only: wakes the initiating thread's poller.
    poller_wakeup: Option<Arc<PollerWakeup>>,
    gc: Pool,
}

impl Ao {
    pub(crate) fn new(
        domid: u32,
        how: Option<AsyncopHow>,
        poller_wakeup: Option<Arc<PollerWakeup>>,
    ) -> Self {
        Self {
            inner: Arc::new(AoInner {
                magic: AtomicU32::new(AO_MAGIC),
                domid,
                state: Mutex::new(AoState {
                    constructing: true,
                    in_initiator: true,
                    complete: false,
                    notified: false,
                    queued_for_callback: false,
                    progress_reports_outstanding: 0,
                    rc: Ok(()),
                    how,
                    poller_wakeup,
                    gc: Pool::new(),
                }),
            }),
        }
    }

    #[must_use]
    pub fn domid(&self) -> u32 { self.inner.domid }

    #[must_use]
    pub fn is_complete(&self) -> bool { self.state().complete }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.magic.load(Ordering::SeqCst) == AO_MAGIC_DESTROYED
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, AoState> { self.inner.state.lock() }

    /// Logs use of a destroyed operation. In debug builds it also panics.
    pub(crate) fn check_magic(&self, what: &str) -> bool {
        let magic = self.inner.magic.load(Ordering::SeqCst);
        if magic == AO_MAGIC {
            return true;
        }
        tracing::error!(message = "use of a dead ao", what = what, magic = magic);
        debug_assert_eq!(magic, AO_MAGIC, "use of a dead ao in {what}");
        false
    }

    /// Runs `f` on the operation's pool, which lives as long as the operation does.
    pub fn with_gc<R>(&self, f: impl FnOnce(&Pool) -> R) -> R { f(&self.state().gc) }

    /// Records the final result. Call exactly once, with the context lock held. The
    /// caller hears about it once outstanding progress reports have been delivered.
    pub fn complete(&self, egc: &mut Egc, rc: AoResult) {
        if !self.check_magic("complete") {
            return;
        }
        {
            let mut st = self.state();
            if st.complete {
                tracing::error!(message = "ao completed twice", domid = self.domid());
                debug_assert!(!st.complete, "ao completed twice");
                return;
            }
            st.complete = true;
            st.rc = rc;
        }
        tracing::debug!(message = "ao complete", domid = self.domid(), rc = rc_of(rc));
        self.complete_check_progress_reports(egc);
    }

    /// Tells the caller, if the operation is complete and no progress report is still on
    /// its way.
    pub(crate) fn complete_check_progress_reports(&self, egc: &mut Egc) {
        let mut st = self.state();
        if !st.complete || st.progress_reports_outstanding > 0 || st.queued_for_callback {
            return;
        }
        match &st.how {
            None => {
                debug_assert!(st.in_initiator, "synchronous ao outlived its initiator");
                if !st.constructing
                    && let Some(wakeup) = &st.poller_wakeup
                {
                    wakeup.wakeup();
                }
                drop(st);
            }
            Some(AsyncopHow::Callback(_)) => {
                st.queued_for_callback = true;
                drop(st);
                egc.queue_ao(self.clone());
                return;
            }
            Some(AsyncopHow::Event { for_event }) => {
                let event = Event::new(
                    self.domid(),
                    *for_event,
                    EventKind::OperationComplete { rc: rc_of(st.rc) },
                );
                st.notified = true;
                drop(st);
                egc.event_occurred(event);
            }
        }
        self.check_destroy();
    }

    /// Runs the completion callback. From egc teardown, with the lock released.
    pub(crate) fn deliver_completion(&self, egc: &mut Egc) {
        if !self.check_magic("deliver_completion") {
            return;
        }
        let (callback, rc) = {
            let mut st = self.state();
            let callback = match st.how.take() {
                Some(AsyncopHow::Callback(it)) => Some(it),
                other => {
                    st.how = other;
                    None
                }
            };
            (callback, st.rc)
        };
        if let Some(callback) = callback {
            callback(egc.ctx(), rc);
        }
        let ctx = egc.ctx().clone();
        let _guard = ctx.lock();
        self.state().notified = true;
        self.check_destroy();
    }

    /// Synchronous operations: the result, once it can be handed back.
    pub(crate) fn take_sync_result(&self) -> Option<AoResult> {
        let mut st = self.state();
        if st.complete && st.progress_reports_outstanding == 0 {
            st.notified = true;
            Some(st.rc)
        } else {
            None
        }
    }

    pub(crate) fn check_destroy(&self) {
        let ready = {
            let st = self.state();
            !st.in_initiator && st.notified
        };
        if ready {
            self.destroy();
        }
    }

    /// Marks the operation dead and frees its pool. Idempotent.
    pub(crate) fn destroy(&self) {
        let was = self.inner.magic.swap(AO_MAGIC_DESTROYED, Ordering::SeqCst);
        if was == AO_MAGIC_DESTROYED {
            return;
        }
        let (gc, how) = {
            let mut st = self.state();
            (std::mem::take(&mut st.gc), st.how.take())
        };
        tracing::debug!(message = "ao destroy", domid = self.domid(), gc_len = gc.len());
        drop((gc, how));
    }
}

impl fmt::Debug for Ao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Ao")
            .field("domid", &self.inner.domid)
            .field("magic", &format_args!("{:#x}", self.inner.magic.load(Ordering::SeqCst)))
            .field("constructing", &st.constructing)
            .field("in_initiator", &st.in_initiator)
            .field("complete", &st.complete)
            .field("notified", &st.notified)
            .field("progress_reports_outstanding", &st.progress_reports_outstanding)
            .field("rc", &st.rc)
            .finish()
    }
}
