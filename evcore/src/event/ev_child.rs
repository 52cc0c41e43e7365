// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc sigchld childproc waitpid errno wnohang echild

//! Child processes and `SIGCHLD`.
//!
//! Who calls `waitpid(2)` depends on [`SigchldOwner`]:
//!
//! - [`Library`]: a `SIGCHLD` handler is installed (through `signal-hook`) while any
//!   child forked with [`EvChild::fork()`] is outstanding. It writes to a self-pipe that
//!   is polled like any other fd source.
//! - [`LibraryAlways`]: the same, but the handler stays installed for the life of the
//!   context.
//! - [`Mainloop`]: the application owns `SIGCHLD`. It either reaps and reports each
//!   status with [`Ctx::childproc_reaped()`], or tells the library to reap its own
//!   children with [`Ctx::childproc_sigchld_occurred()`].
//!
//! Reaping is always selective. Only pids that were forked here are waited for, so other
//! children of the process are left to whoever owns them.
//!
//! [`Library`]: SigchldOwner::Library
//! [`LibraryAlways`]: SigchldOwner::LibraryAlways
//! [`Mainloop`]: SigchldOwner::Mainloop

use super::{Egc, EvFd};
use crate::{CoreError, CoreResult, Ctx, SigchldOwner, carefd};
use nix::{errno::Errno,
          poll::PollFlags,
          sys::wait::{WaitPidFlag, WaitStatus, waitpid},
          unistd::{ForkResult, Pid}};
use std::{collections::BTreeMap,
          io::{self, Read as _},
          os::{fd::{AsRawFd as _, RawFd},
               unix::net::UnixStream},
          sync::{Arc,
                 atomic::{AtomicBool, Ordering}}};

/// Called once, when the child has been reaped.
pub type ChildCallback = Box<dyn FnOnce(&mut Egc, Pid, WaitStatus) + Send>;

pub(crate) struct ChildReg {
    cb: Option<ChildCallback>,
    live: Arc<AtomicBool>,
}

/// Outstanding children by pid, and the `SIGCHLD` self-pipe while one is installed.
#[derive(Default)]
pub(crate) struct ChildTable {
    regs: BTreeMap<i32, ChildReg>,
    sigchld: Option<SigchldPipe>,
}

impl ChildTable {
    pub(crate) fn len(&self) -> usize { self.regs.len() }

    pub(crate) fn sigchld_installed(&self) -> bool { self.sigchld.is_some() }
}

struct SigchldPipe {
    sig_id: signal_hook::SigId,
    rx: UnixStream,
    efd: EvFd,
}

impl Drop for SigchldPipe {
    fn drop(&mut self) { signal_hook::low_level::unregister(self.sig_id); }
}

/// Which side of [`EvChild::fork()`] this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent(Pid),
    /// The caller must exec or `_exit(2)`. It must not return into the event loop.
    Child,
}

/// One forked child. Not reusable: once the callback has run the handle stays out of use.
#[derive(Debug, Default)]
pub struct EvChild {
    pid: Option<Pid>,
    live: Option<Arc<AtomicBool>>,
}

impl EvChild {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// True from a successful fork until the child has been reaped.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.live.as_ref().is_some_and(|it| it.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn pid(&self) -> Option<Pid> { self.pid }

    /// Forks, holding the carefd guard across the fork so that no unguarded descriptor
    /// leaks into the child. In the parent the child is tracked and `callback` runs once
    /// it has been reaped.
    ///
    /// # Errors
    ///
    /// If the `SIGCHLD` handler can't be installed, or the fork fails.
    pub fn fork(
        &mut self,
        ctx: &Ctx,
        callback: impl FnOnce(&mut Egc, Pid, WaitStatus) + Send + 'static,
    ) -> CoreResult<ForkOutcome> {
        let _guard = ctx.lock();
        debug_assert!(!self.is_in_use(), "EvChild forked while in use");

        let (owner, replacement) = ctx.with_state(|st| {
            (st.childproc.owner, st.childproc.fork_replacement.clone())
        });
        if owner == SigchldOwner::Library {
            ctx.sigchld_install()?;
        }

        let bracket = carefd::begin();
        let forked = match &replacement {
            Some(fork) => fork(),
            // SAFETY: the child only allocates and logs before it execs or exits.
            None => unsafe { nix::unistd::fork() },
        };
        bracket.unlock();

        match forked {
            Err(errno) => {
                tracing::error!(message = "fork failed", error = ?errno);
                ctx.sigchld_release_if_idle();
                Err(CoreError::errno("fork", errno as i32))
            }
            Ok(ForkResult::Child) => Ok(ForkOutcome::Child),
            Ok(ForkResult::Parent { child }) => {
                let live = Arc::new(AtomicBool::new(true));
                let reg = ChildReg {
                    cb: Some(Box::new(callback)),
                    live: live.clone(),
                };
                ctx.with_state(|st| st.children.regs.insert(child.as_raw(), reg));
                tracing::debug!(message = "child forked", pid = child.as_raw());
                self.pid = Some(child);
                self.live = Some(live);
                Ok(ForkOutcome::Parent(child))
            }
        }
    }
}

impl Ctx {
    /// Installs the `SIGCHLD` self-pipe if it isn't already. Takes the lock.
    pub(crate) fn sigchld_install(&self) -> CoreResult<()> {
        let _guard = self.lock();
        if self.with_state(|st| st.children.sigchld.is_some()) {
            return Ok(());
        }

        let (tx, rx) = UnixStream::pair()
            .map_err(|err| CoreError::os("creating the SIGCHLD self-pipe", err))?;
        for end in [&tx, &rx] {
            end.set_nonblocking(true)
                .map_err(|err| CoreError::os("making the SIGCHLD self-pipe non-blocking", err))?;
        }
        let rx_fd = rx.as_raw_fd();
        let sig_id = signal_hook::low_level::pipe::register(signal_hook::consts::SIGCHLD, tx)
            .map_err(|err| CoreError::os("installing the SIGCHLD handler", err))?;

        let mut efd = EvFd::new();
        if let Err(err) = efd.register(self, sigchld_callback, rx_fd, PollFlags::POLLIN) {
            signal_hook::low_level::unregister(sig_id);
            return Err(err);
        }
        self.with_state(|st| st.children.sigchld = Some(SigchldPipe { sig_id, rx, efd }));
        tracing::debug!(message = "SIGCHLD handler installed");
        Ok(())
    }

    /// Removes the handler when the owner is [`SigchldOwner::Library`] and no children
    /// are outstanding.
    pub(crate) fn sigchld_release_if_idle(&self) {
        let idle = self.with_state(|st| {
            st.childproc.owner == SigchldOwner::Library && st.children.regs.is_empty()
        });
        if idle {
            self.sigchld_remove();
        }
    }

    pub(crate) fn sigchld_remove(&self) {
        let _guard = self.lock();
        let Some(mut pipe) = self.with_state(|st| st.children.sigchld.take()) else {
            return;
        };
        pipe.efd.deregister(self);
        drop(pipe);
        tracing::debug!(message = "SIGCHLD handler removed");
    }

    /// For [`SigchldOwner::Mainloop`]: the application reaped `pid` itself and hands
    /// over its raw wait status.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownChild`] if `pid` wasn't forked by this context, or an OS error
    /// if `status` can't be decoded.
    pub fn childproc_reaped(&self, pid: Pid, status: i32) -> CoreResult<()> {
        let mut egc = Egc::new(self);
        let _guard = self.lock();
        let status = WaitStatus::from_raw(pid, status)
            .map_err(|errno| CoreError::errno("decoding a wait status", errno as i32))?;
        if childproc_reaped_locked(&mut egc, pid, status) {
            Ok(())
        } else {
            Err(CoreError::UnknownChild { pid: pid.as_raw() })
        }
    }

    /// For [`SigchldOwner::Mainloop`]: the application saw `SIGCHLD` and wants the
    /// library to reap whichever of its own children have exited.
    pub fn childproc_sigchld_occurred(&self) {
        let mut egc = Egc::new(self);
        let _guard = self.lock();
        childproc_checkall(&mut egc);
    }
}

fn sigchld_callback(egc: &mut Egc, _fd: RawFd, _events: PollFlags, _revents: PollFlags) {
    let ctx = egc.ctx().clone();
    ctx.with_state(|st| {
        if let Some(pipe) = &st.children.sigchld {
            drain(&pipe.rx);
        }
    });
    childproc_checkall(egc);
}

fn drain(mut rx: &UnixStream) {
    let mut buf = [0_u8; 64];
    loop {
        match rx.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

/// Waits (without blocking) for each outstanding child in turn. Caller holds the lock.
fn childproc_checkall(egc: &mut Egc) {
    let ctx = egc.ctx().clone();
    let pids: Vec<i32> = ctx.with_state(|st| st.children.regs.keys().copied().collect());
    for raw in pids {
        let pid = Pid::from_raw(raw);
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    childproc_reaped_locked(egc, pid, status);
                    break;
                }
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    egc.event_disaster(
                        &format!("waitpid({raw}) failed"),
                        errno as i32,
                        None,
                    );
                    return;
                }
            }
        }
    }
}

/// Runs the callback for `pid`. False if it isn't one of ours.
fn childproc_reaped_locked(egc: &mut Egc, pid: Pid, status: WaitStatus) -> bool {
    let ctx = egc.ctx().clone();
    let Some(mut reg) = ctx.with_state(|st| st.children.regs.remove(&pid.as_raw())) else {
        tracing::debug!(message = "reaped a child that is not ours", pid = pid.as_raw());
        return false;
    };
    reg.live.store(false, Ordering::SeqCst);
    tracing::debug!(message = "child reaped", pid = pid.as_raw(), status = ?status);
    if let Some(callback) = reg.cb.take() {
        callback(egc, pid, status);
    }
    ctx.sigchld_release_if_idle();
    true
}
