// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc domid inprogress

use super::{Ao, AsyncopHow};
use crate::{AoResult, CoreError, CoreResult, Ctx, CtxGuard, Egc, ErrorCode, Poller,
            eventloop_iteration, rc_of};
use std::{fmt, thread, time::Duration};

/// How long a synchronous wait backs off after the event loop fails.
const EVENTLOOP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The initiating call of a slow operation, from creation until it returns to its
/// caller.
///
/// ```text
/// let mut op = AoOp::create(ctx, domid, ao_how)?;   // egc made, lock taken
/// ... register event sources, using op.ao() and op.egc() ...
/// op.inprogress()                                   // lock released, egc flushed
/// ```
///
/// If setup fails, [`abort()`](Self::abort) instead. Dropping an `AoOp` that was neither
/// put in progress nor aborted aborts it with [`ErrorCode::NonSpecific`].
///
/// Without an [`AsyncopHow`] the operation is synchronous: [`inprogress()`] runs the
/// event loop on this thread until the operation completes and returns its result.
///
/// [`inprogress()`]: Self::inprogress
pub struct AoOp<'c> {
    ctx: &'c Ctx,
    ao: Ao,
    poller: Option<Poller>,
    /// Released before `egc` is dropped.
    guard: Option<CtxGuard<'c>>,
    egc: Option<Egc>,
    finished: bool,
}

impl<'c> AoOp<'c> {
    /// # Errors
    ///
    /// [`CoreError::Poisoned`] after an event-loop disaster, or an OS error if a
    /// synchronous operation can't get a poller.
    pub fn create(ctx: &'c Ctx, domid: u32, how: Option<AsyncopHow>) -> CoreResult<Self> {
        if ctx.is_poisoned() {
            tracing::error!(message = "ao create refused, ctx is poisoned", domid = domid);
            return Err(CoreError::Poisoned);
        }
        let egc = Egc::new(ctx);
        let guard = ctx.lock();
        let poller = match how {
            None => Some(ctx.poller_get()?),
            Some(_) => None,
        };
        tracing::debug!(message = "ao create", domid = domid, how = ?how);
        let ao = Ao::new(domid, how, poller.as_ref().map(Poller::wakeup_handle));
        Ok(Self {
            ctx,
            ao,
            poller,
            guard: Some(guard),
            egc: Some(egc),
            finished: false,
        })
    }

    #[must_use]
    pub fn ao(&self) -> &Ao { &self.ao }

    #[must_use]
    pub fn ctx(&self) -> &'c Ctx { self.ctx }

    pub fn egc(&mut self) -> &mut Egc {
        let ctx = self.ctx;
        self.egc.get_or_insert_with(|| Egc::new(ctx))
    }

    /// Setup succeeded. Asynchronous operations return `Ok(())` straight away; the
    /// result arrives later as asked for. Synchronous operations return the result.
    pub fn inprogress(mut self) -> AoResult {
        self.ao.check_magic("inprogress");
        self.ao.state().constructing = false;

        let rc = match self.poller.as_mut() {
            None => Ok(()),
            Some(poller) => loop {
                if let Some(rc) = self.ao.take_sync_result() {
                    break rc;
                }
                let Some(guard) = self.guard.as_mut() else {
                    break Err(ErrorCode::Fail);
                };
                let egc = self.egc.get_or_insert_with(|| Egc::new(self.ctx));
                if let Err(err) = eventloop_iteration(egc, guard, poller) {
                    tracing::error!(
                        message = "event loop failed while waiting for an ao, retrying",
                        domid = self.ao.domid(),
                        error = ?err
                    );
                    guard.unlocked(|| thread::sleep(EVENTLOOP_RETRY_DELAY));
                }
                // Flush what this round produced, unlocked, and start afresh.
                if let Some(done) = self.egc.take() {
                    guard.unlocked(|| drop(done));
                }
            },
        };

        self.ao.state().in_initiator = false;
        self.ao.check_destroy();
        tracing::debug!(message = "ao inprogress", domid = self.ao.domid(), rc = rc_of(rc));
        self.finish();
        rc
    }

    /// Setup failed. The operation is destroyed without its caller ever being told
    /// anything beyond the returned code.
    pub fn abort(mut self, code: ErrorCode) -> ErrorCode {
        self.abort_inner(code);
        code
    }

    fn abort_inner(&mut self, code: ErrorCode) {
        tracing::debug!(message = "ao abort", domid = self.ao.domid(), rc = code.rc());
        {
            let st = self.ao.state();
            debug_assert!(st.constructing && st.in_initiator, "abort of a started ao");
        }
        self.ao.destroy();
        self.finish();
    }

    /// Returns the poller, releases the lock, then flushes the egc.
    fn finish(&mut self) {
        self.finished = true;
        if let Some(poller) = self.poller.take() {
            self.ctx.poller_put(poller);
        }
        drop(self.guard.take());
        drop(self.egc.take());
    }
}

impl Drop for AoOp<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_inner(ErrorCode::NonSpecific);
        }
    }
}

impl fmt::Debug for AoOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AoOp")
            .field("ao", &self.ao)
            .field("synchronous", &self.poller.is_some())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
