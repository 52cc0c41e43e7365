// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words sigchld mainloop childproc osevent

use crate::{ConfigStore, EventHooks, OsEventHooks, TracingConfig};
use std::{fmt, sync::Arc};

/// Everything needed to build a [`Ctx`](crate::Ctx).
///
/// Only the store is mandatory. Hooks left as [`None`] can be installed later with
/// [`Ctx::event_register_callbacks()`], [`Ctx::osevent_register_hooks()`] and
/// [`Ctx::childproc_setmode()`].
///
/// [`Ctx::childproc_setmode()`]: crate::Ctx::childproc_setmode
/// [`Ctx::event_register_callbacks()`]: crate::Ctx::event_register_callbacks
/// [`Ctx::osevent_register_hooks()`]: crate::Ctx::osevent_register_hooks
pub struct CtxConfig {
    pub store: Arc<dyn ConfigStore>,
    pub childproc: ChildProcHooks,
    pub event_hooks: Option<Arc<dyn EventHooks>>,
    pub osevent_hooks: Option<Arc<dyn OsEventHooks>>,
    /// Installed as the global subscriber by [`Ctx::new()`](crate::Ctx::new), unless one
    /// is already installed.
    pub tracing: Option<TracingConfig>,
}

impl CtxConfig {
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            childproc: ChildProcHooks::default(),
            event_hooks: None,
            osevent_hooks: None,
            tracing: None,
        }
    }

    #[must_use]
    pub fn with_childproc(mut self, childproc: ChildProcHooks) -> Self {
        self.childproc = childproc;
        self
    }

    #[must_use]
    pub fn with_event_hooks(mut self, hooks: Arc<dyn EventHooks>) -> Self {
        self.event_hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_osevent_hooks(mut self, hooks: Arc<dyn OsEventHooks>) -> Self {
        self.osevent_hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = Some(tracing);
        self
    }
}

impl fmt::Debug for CtxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtxConfig")
            .field("childproc", &self.childproc)
            .field("event_hooks", &self.event_hooks.is_some())
            .field("osevent_hooks", &self.osevent_hooks.is_some())
            .field("tracing", &self.tracing)
            .finish_non_exhaustive()
    }
}

/// Who waits for child processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigchldOwner {
    /// The library installs a `SIGCHLD` handler while it has children, and reaps only
    /// the pids it forked.
    #[default]
    Library,
    /// As [`Library`](Self::Library), but the handler stays installed for the whole
    /// life of the context.
    LibraryAlways,
    /// The application owns `SIGCHLD` and `waitpid`. It must pass every status it reaps
    /// for one of our pids to [`Ctx::childproc_reaped()`](crate::Ctx::childproc_reaped).
    Mainloop,
}

/// Replacement for `fork(2)`, eg for applications that need to do their own bookkeeping
/// around it.
pub type ForkReplacement =
    Arc<dyn Fn() -> nix::Result<nix::unistd::ForkResult> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ChildProcHooks {
    pub owner: SigchldOwner,
    pub fork_replacement: Option<ForkReplacement>,
}

impl ChildProcHooks {
    #[must_use]
    pub fn new(owner: SigchldOwner) -> Self {
        Self {
            owner,
            fork_replacement: None,
        }
    }
}

impl fmt::Debug for ChildProcHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcHooks")
            .field("owner", &self.owner)
            .field("fork_replacement", &self.fork_replacement.is_some())
            .finish()
    }
}
