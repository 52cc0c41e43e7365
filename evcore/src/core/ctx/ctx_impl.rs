// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words osevent childproc sigchld egc

use super::{ChildProcHooks, CtxConfig, SigchldOwner};
use crate::{ChildTable, ConfigStore, CoreResult, EventHooks, EventQueue, EvId, FdTable,
            OsEventHooks, Poller, PollerLists, TimerQueue, WatchTable};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::{cell::RefCell,
          fmt,
          sync::{Arc,
                 atomic::{AtomicBool, Ordering}}};

/// The shared context. Cheap to clone; every clone refers to the same state.
///
/// All registration tables, the poller lists and the queue of undelivered events live
/// behind one recursive lock. Take it with [`lock()`](Self::lock). Internal code gets
/// short-lived access to the state through `with_state()`, and never calls out to event
/// callbacks or application hooks from inside it.
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

struct CtxInner {
    lock: ReentrantMutex<RefCell<CtxState>>,
    poisoned: AtomicBool,
}

/// State guarded by the context lock.
pub(crate) struct CtxState {
    next_id: u64,
    pub(crate) fds: FdTable,
    pub(crate) timers: TimerQueue,
    pub(crate) watches: WatchTable,
    pub(crate) children: ChildTable,
    pub(crate) pollers: PollerLists,
    pub(crate) events: EventQueue,
    pub(crate) event_hooks: Option<Arc<dyn EventHooks>>,
    pub(crate) osevent_hooks: Option<Arc<dyn OsEventHooks>>,
    pub(crate) childproc: ChildProcHooks,
    pub(crate) store: Arc<dyn ConfigStore>,
}

impl CtxState {
    /// Ids are never reused, so they double as the tie-break sequence for timers.
    pub(crate) fn alloc_id(&mut self) -> EvId {
        self.next_id += 1;
        EvId(self.next_id)
    }
}

/// RAII handle for the context lock. The lock is recursive: taking it again on the same
/// thread nests.
pub struct CtxGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<CtxState>>,
}

impl CtxGuard<'_> {
    /// Releases one level of the lock while `f` runs, then takes it back.
    pub fn unlocked<U>(&mut self, f: impl FnOnce() -> U) -> U {
        ReentrantMutexGuard::unlocked(&mut self.guard, f)
    }
}

impl fmt::Debug for CtxGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CtxGuard")
    }
}

impl fmt::Debug for Ctx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl Ctx {
    /// # Errors
    ///
    /// If the application poller's wakeup pipe can't be created, or the `SIGCHLD`
    /// handler can't be installed for [`SigchldOwner::LibraryAlways`].
    pub fn new(config: CtxConfig) -> CoreResult<Self> {
        let CtxConfig {
            store,
            childproc,
            event_hooks,
            osevent_hooks,
            tracing: tracing_config,
        } = config;

        if let Some(tracing_config) = tracing_config
            && let Err(err) = tracing_config.install_global()
        {
            tracing::debug!(message = "global subscriber not installed", error = ?err);
        }

        let app = Poller::try_new(0)?;
        let owner = childproc.owner;
        let state = CtxState {
            next_id: 0,
            fds: FdTable::default(),
            timers: TimerQueue::default(),
            watches: WatchTable::default(),
            children: ChildTable::default(),
            pollers: PollerLists::new(app),
            events: EventQueue::default(),
            event_hooks,
            osevent_hooks,
            childproc,
            store,
        };
        let ctx = Self {
            inner: Arc::new(CtxInner {
                lock: ReentrantMutex::new(RefCell::new(state)),
                poisoned: AtomicBool::new(false),
            }),
        };

        if owner == SigchldOwner::LibraryAlways {
            ctx.sigchld_install()?;
        }

        tracing::debug!(message = "ctx created", sigchld_owner = ?owner);
        Ok(ctx)
    }

    /// Takes the context lock.
    pub fn lock(&self) -> CtxGuard<'_> {
        CtxGuard {
            guard: self.inner.lock.lock(),
        }
    }

    #[must_use]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.inner.lock.is_owned_by_current_thread()
    }

    /// Runs `f` with the lock held and the state borrowed. `f` must not re-enter.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CtxState) -> R) -> R {
        let guard = self.inner.lock.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Set once an event-loop disaster has been reported. Permanent.
    #[must_use]
    pub fn is_poisoned(&self) -> bool { self.inner.poisoned.load(Ordering::SeqCst) }

    pub(crate) fn poison(&self) { self.inner.poisoned.store(true, Ordering::SeqCst); }

    #[must_use]
    pub fn store(&self) -> Arc<dyn ConfigStore> { self.with_state(|st| st.store.clone()) }

    /// Installs (or with [`None`] removes) the application's event hooks. Events that are
    /// already queued on the context stay there.
    pub fn event_register_callbacks(&self, hooks: Option<Arc<dyn EventHooks>>) {
        let old = self.with_state(|st| std::mem::replace(&mut st.event_hooks, hooks));
        drop(old);
    }

    /// Installs the application's event-loop hooks. Registrations that already exist are
    /// not replayed, so call this before registering anything.
    pub fn osevent_register_hooks(&self, hooks: Option<Arc<dyn OsEventHooks>>) {
        let old = self.with_state(|st| std::mem::replace(&mut st.osevent_hooks, hooks));
        drop(old);
    }

    /// Changes who owns `SIGCHLD`. Must not be called while children are outstanding.
    ///
    /// # Errors
    ///
    /// If the handler can't be installed for [`SigchldOwner::LibraryAlways`].
    pub fn childproc_setmode(&self, hooks: ChildProcHooks) -> CoreResult<()> {
        let _guard = self.lock();
        let owner = hooks.owner;
        let old = self.with_state(|st| std::mem::replace(&mut st.childproc, hooks));
        drop(old);
        match owner {
            SigchldOwner::LibraryAlways => self.sigchld_install(),
            SigchldOwner::Library => {
                self.sigchld_release_if_idle();
                Ok(())
            }
            SigchldOwner::Mainloop => {
                self.sigchld_remove();
                Ok(())
            }
        }
    }
}
