// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc xspath pidpath midproc waitpid

//! Double-fork daemon spawn.
//!
//! ```text
//!  parent ── fork ──► middle ── fork ──► inner (execs the daemon)
//!    ▲                  │
//!    └── pid pipe ◄─────┘   middle: midproc_cb(inner), report pid, wait for inner
//! ```
//!
//! The parent watches `xspath`, where the daemon confirms that it has started, and
//! runs a timeout. Every change of `xspath` goes to `confirm_cb`, which calls
//! [`SpawnState::detach()`] once it has seen enough. Detaching kills the middle process,
//! which leaves the daemon reparented away from the caller. The middle process is then
//! reaped in the background.
//!
//! | Phase      | Meaning                                                        |
//! | :--------- | :------------------------------------------------------------- |
//! | `Idle`     | nothing running, `spawn()` may be called                       |
//! | `Active`   | waiting for confirmation; must eventually be detached          |
//! | `Detached` | middle process killed but not yet reaped; `spawn()` may be called |

use super::report_child_exitstatus;
use crate::{Carefd, ConfigStore as _, CoreError, CoreResult, Ctx, Egc, EvChild, EvFd,
            EvTime, EvWatch, ForkOutcome, carefd};
use nix::{errno::Errno,
          poll::PollFlags,
          sys::{signal::{Signal, kill},
                wait::{WaitStatus, waitpid}},
          unistd::{ForkResult, Pid}};
use parking_lot::Mutex;
use std::{fmt,
          os::fd::RawFd,
          sync::{Arc, Weak},
          time::Duration};
use tracing::Level;

/// Runs in the middle process with the inner pid. Returning a signal sends it to the
/// inner process and fails the spawn.
pub type MidprocCallback = Arc<dyn Fn(Pid) -> Option<Signal> + Send + Sync>;

/// Runs with the context lock held each time `xspath` changes while Active: with its
/// contents, or [`None`] if it doesn't exist.
pub type ConfirmCallback = Box<dyn FnMut(&mut Egc, &SpawnState, Option<&str>) + Send>;

/// Runs with the context lock held when the spawn has failed. The reason has been
/// logged, and the state is no longer Active.
pub type FailureCallback = Box<dyn FnMut(&mut Egc, &SpawnState) + Send>;

/// Exit status of the middle process when it gives up on the inner one.
pub const MIDPROC_FAILED_STATUS: i32 = 127;

/// Size of the inner pid as it travels through the pid pipe.
const PID_LEN: usize = std::mem::size_of::<i32>();

pub struct SpawnConfig {
    /// Names the daemon in log messages.
    pub what: String,
    pub xspath: String,
    /// Where the parent records the inner pid, if anywhere.
    pub pidpath: Option<String>,
    /// [`None`] waits for confirmation forever.
    pub timeout: Option<Duration>,
    pub midproc_cb: Option<MidprocCallback>,
    pub confirm_cb: ConfirmCallback,
    pub failure_cb: FailureCallback,
}

impl SpawnConfig {
    pub fn new(
        what: impl Into<String>,
        xspath: impl Into<String>,
        confirm_cb: impl FnMut(&mut Egc, &SpawnState, Option<&str>) + Send + 'static,
        failure_cb: impl FnMut(&mut Egc, &SpawnState) + Send + 'static,
    ) -> Self {
        Self {
            what: what.into(),
            xspath: xspath.into(),
            pidpath: None,
            timeout: None,
            midproc_cb: None,
            confirm_cb: Box::new(confirm_cb),
            failure_cb: Box::new(failure_cb),
        }
    }

    #[must_use]
    pub fn with_pidpath(mut self, pidpath: impl Into<String>) -> Self {
        self.pidpath = Some(pidpath.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_midproc(
        mut self,
        midproc_cb: impl Fn(Pid) -> Option<Signal> + Send + Sync + 'static,
    ) -> Self {
        self.midproc_cb = Some(Arc::new(midproc_cb));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SpawnPhase {
    Idle,
    Active,
    Detached,
}

/// Which process [`SpawnState::spawn()`] returned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// The caller, with the middle process pid. The state is Active.
    Parent(Pid),
    /// The process that is to become the daemon. It must exec or `_exit(2)`.
    InnerChild,
}

/// One daemon spawn. Clones refer to the same spawn. See the [module docs](self).
///
/// An Active spawn must eventually be detached, by `confirm_cb` or by the owner.
#[derive(Clone)]
pub struct SpawnState {
    inner: Arc<Mutex<SpawnInner>>,
}

struct SpawnInner {
    what: String,
    xspath: String,
    pidpath: Option<String>,
    timeout: Option<Duration>,
    midproc_cb: Option<MidprocCallback>,
    /// Lent out while running.
    confirm_cb: Option<ConfirmCallback>,
    failure_cb: Option<FailureCallback>,
    timeout_ev: EvTime,
    watch: EvWatch,
    pid_efd: EvFd,
    pid_rx: Carefd,
    pid_buf: Vec<u8>,
    inner_pid: Option<Pid>,
    /// The middle process of the latest spawn, until it has been detached and reaped.
    mid: Option<Arc<Mutex<MidProc>>>,
}

#[derive(Debug)]
struct MidProc {
    pid: Option<Pid>,
    detached: bool,
    reaped: bool,
}

impl SpawnState {
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        let SpawnConfig {
            what,
            xspath,
            pidpath,
            timeout,
            midproc_cb,
            confirm_cb,
            failure_cb,
        } = config;
        Self {
            inner: Arc::new(Mutex::new(SpawnInner {
                what,
                xspath,
                pidpath,
                timeout,
                midproc_cb,
                confirm_cb: Some(confirm_cb),
                failure_cb: Some(failure_cb),
                timeout_ev: EvTime::new(),
                watch: EvWatch::new(),
                pid_efd: EvFd::new(),
                pid_rx: Carefd::none(),
                pid_buf: Vec::with_capacity(PID_LEN),
                inner_pid: None,
                mid: None,
            })),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SpawnPhase {
        let inner = self.inner.lock();
        match &inner.mid {
            None => SpawnPhase::Idle,
            Some(mid) if mid.lock().detached => SpawnPhase::Detached,
            Some(_) => SpawnPhase::Active,
        }
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool { self.phase() == SpawnPhase::Active }

    #[must_use]
    pub fn what(&self) -> String { self.inner.lock().what.clone() }

    /// The daemon's pid, once the middle process has reported it.
    #[must_use]
    pub fn inner_pid(&self) -> Option<Pid> { self.inner.lock().inner_pid }

    /// Forks twice. In the caller this returns [`SpawnOutcome::Parent`] with the state
    /// Active; in the daemon-to-be it returns [`SpawnOutcome::InnerChild`]. The middle
    /// process never returns. Neither callback runs from inside this call.
    ///
    /// # Errors
    ///
    /// [`CoreError::Invalid`] if the state is Active. Otherwise whatever registration,
    /// pipe creation or fork failed; the error has been logged and nothing is left
    /// running. If setup fails after the fork the middle process has been killed and
    /// the state is Detached.
    pub fn spawn(&self, ctx: &Ctx) -> CoreResult<SpawnOutcome> {
        let _guard = ctx.lock();
        if self.is_in_use() {
            return Err(CoreError::Invalid {
                what: "spawn of a spawn state that is already Active".into(),
            });
        }
        let weak = Arc::downgrade(&self.inner);

        let (what, midproc_cb) = {
            let mut inner = self.inner.lock();
            inner.inner_pid = None;
            inner.pid_buf.clear();
            let (xspath, timeout) = (inner.xspath.clone(), inner.timeout);

            let on_timeout = {
                let weak = weak.clone();
                move |egc: &mut Egc, _| spawn_timeout(egc, &weak)
            };
            inner.timeout_ev.register_rel(ctx, on_timeout, timeout)?;

            let on_watch = {
                let weak = weak.clone();
                move |egc: &mut Egc, _: &str, _: &str| spawn_watch_event(egc, &weak)
            };
            if let Err(err) = inner.watch.register(ctx, on_watch, &xspath) {
                inner.timeout_ev.deregister(ctx);
                return Err(err);
            }
            (inner.what.clone(), inner.midproc_cb.clone())
        };

        let mut bracket = carefd::begin();
        let (pid_rx, pid_tx) = match rustix::pipe::pipe() {
            Ok((rx, tx)) => (bracket.record(rx), bracket.record(tx)),
            Err(errno) => {
                bracket.unlock();
                tracing::error!(message = "spawn: unable to create the pid pipe", what = %what, error = ?errno);
                self.deregister_all(ctx);
                return Err(CoreError::errno("creating the spawn pid pipe", errno.raw_os_error()));
            }
        };
        bracket.unlock();

        let mid = Arc::new(Mutex::new(MidProc {
            pid: None,
            detached: false,
            reaped: false,
        }));
        let on_reaped = {
            let weak = weak.clone();
            let mid = mid.clone();
            move |egc: &mut Egc, pid, status| middle_reaped(egc, &weak, &mid, pid, status)
        };
        let pid = match EvChild::new().fork(ctx, on_reaped) {
            Err(err) => {
                tracing::error!(message = "spawn: unable to fork the middle process", what = %what, error = ?err);
                drop((pid_rx, pid_tx));
                self.deregister_all(ctx);
                return Err(err);
            }
            Ok(ForkOutcome::Child) => {
                drop(pid_rx);
                return Ok(run_middle(pid_tx, midproc_cb.as_deref()));
            }
            Ok(ForkOutcome::Parent(pid)) => pid,
        };
        drop(pid_tx);
        mid.lock().pid = Some(pid);

        let registered = {
            let mut inner = self.inner.lock();
            inner.mid = Some(mid);
            let rx_fd = pid_rx.fd();
            let on_pid = move |egc: &mut Egc, _: RawFd, _: PollFlags, _: PollFlags| {
                pid_readable(egc, &weak);
            };
            let registered = set_nonblocking(&pid_rx)
                .and_then(|()| inner.pid_efd.register(ctx, on_pid, rx_fd, PollFlags::POLLIN));
            inner.pid_rx = pid_rx;
            registered
        };
        if let Err(err) = registered {
            tracing::error!(message = "spawn: unable to watch the pid pipe", what = %what, error = ?err);
            self.detach(ctx);
            return Err(err);
        }

        tracing::debug!(message = "spawn: middle process forked", what = %what, pid = pid.as_raw());
        Ok(SpawnOutcome::Parent(pid))
    }

    /// Stops watching for confirmation and kills the middle process, which is reaped
    /// later in the background. From here on neither `confirm_cb` nor `failure_cb` runs
    /// for this spawn. Idempotent.
    pub fn detach(&self, ctx: &Ctx) {
        let _guard = ctx.lock();
        let mid = self.deregister_all(ctx);
        let Some(mid) = mid else {
            return;
        };
        let (pid, reaped, was_detached) = {
            let mut it = mid.lock();
            let was_detached = it.detached;
            it.detached = true;
            (it.pid, it.reaped, was_detached)
        };
        if reaped {
            self.forget_middle(&mid);
            return;
        }
        if was_detached {
            return;
        }
        let what = self.what();
        if let Some(pid) = pid {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => tracing::debug!(message = "spawn: detached", what = %what, pid = pid.as_raw()),
                Err(errno) => tracing::error!(
                    message = "spawn: unable to kill the middle process",
                    what = %what,
                    pid = pid.as_raw(),
                    error = ?errno
                ),
            }
        }
    }

    /// Ends every registration and returns the current middle process, if any.
    fn deregister_all(&self, ctx: &Ctx) -> Option<Arc<Mutex<MidProc>>> {
        let (mid, pid_rx) = {
            let mut inner = self.inner.lock();
            inner.timeout_ev.deregister(ctx);
            inner.watch.deregister(ctx);
            inner.pid_efd.deregister(ctx);
            (inner.mid.clone(), std::mem::replace(&mut inner.pid_rx, Carefd::none()))
        };
        pid_rx.close();
        mid
    }

    /// Back to Idle, unless a newer spawn has started since `mid` was detached.
    fn forget_middle(&self, mid: &Arc<Mutex<MidProc>>) {
        let mut inner = self.inner.lock();
        if inner.mid.as_ref().is_some_and(|it| Arc::ptr_eq(it, mid)) {
            inner.mid = None;
        }
    }

    fn confirm(&self, egc: &mut Egc, data: Option<&str>) {
        let Some(mut callback) = self.inner.lock().confirm_cb.take() else {
            return;
        };
        callback(egc, self, data);
        let mut inner = self.inner.lock();
        if inner.confirm_cb.is_none() {
            inner.confirm_cb = Some(callback);
        }
    }

    /// Detaches, then tells the owner. Always the last thing done for a failed spawn.
    fn fail(&self, egc: &mut Egc) {
        self.detach(egc.ctx());
        let Some(mut callback) = self.inner.lock().failure_cb.take() else {
            return;
        };
        callback(egc, self);
        let mut inner = self.inner.lock();
        if inner.failure_cb.is_none() {
            inner.failure_cb = Some(callback);
        }
    }
}

impl fmt::Debug for SpawnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = self.phase();
        let inner = self.inner.lock();
        f.debug_struct("SpawnState")
            .field("what", &inner.what)
            .field("xspath", &inner.xspath)
            .field("phase", &phase)
            .field("inner_pid", &inner.inner_pid)
            .finish_non_exhaustive()
    }
}

fn set_nonblocking(fd: &Carefd) -> CoreResult<()> {
    let Some(fd) = fd.as_fd() else {
        return Ok(());
    };
    rustix::io::ioctl_fionbio(fd, true)
        .map_err(|errno| CoreError::errno("making the pid pipe non-blocking", errno.raw_os_error()))
}

/// The still-Active spawn behind `weak`, if there is one.
fn active(weak: &Weak<Mutex<SpawnInner>>) -> Option<SpawnState> {
    let state = SpawnState {
        inner: weak.upgrade()?,
    };
    state.is_in_use().then_some(state)
}

fn spawn_watch_event(egc: &mut Egc, weak: &Weak<Mutex<SpawnInner>>) {
    let Some(state) = active(weak) else {
        return;
    };
    let xspath = state.inner.lock().xspath.clone();
    match egc.ctx().store().read(&xspath) {
        Ok(data) => state.confirm(egc, data.as_deref()),
        Err(err) => {
            tracing::error!(
                message = "spawn: unable to read the confirmation path",
                what = %state.what(),
                xspath = %xspath,
                error = ?err
            );
            state.fail(egc);
        }
    }
}

fn spawn_timeout(egc: &mut Egc, weak: &Weak<Mutex<SpawnInner>>) {
    let Some(state) = active(weak) else {
        return;
    };
    tracing::error!(message = "spawn: startup timed out", what = %state.what());
    state.fail(egc);
}

fn pid_readable(egc: &mut Egc, weak: &Weak<Mutex<SpawnInner>>) {
    let Some(state) = active(weak) else {
        return;
    };
    let ctx = egc.ctx().clone();
    let got = {
        let mut inner = state.inner.lock();
        let mut buf = [0_u8; PID_LEN];
        let want = PID_LEN - inner.pid_buf.len();
        let Some(rx) = inner.pid_rx.as_fd() else {
            return;
        };
        match rustix::io::read(rx, &mut buf[..want]) {
            Ok(0) => Err(None),
            Ok(n) => {
                inner.pid_buf.extend_from_slice(&buf[..n]);
                Ok(<[u8; PID_LEN]>::try_from(inner.pid_buf.as_slice()).ok())
            }
            Err(rustix::io::Errno::AGAIN | rustix::io::Errno::INTR) => Ok(None),
            Err(errno) => Err(Some(errno)),
        }
    };

    let pid = match got {
        Ok(None) => return,
        Ok(Some(bytes)) => Pid::from_raw(i32::from_ne_bytes(bytes)),
        Err(errno) => {
            // The middle process is on its way out; reaping it reports the failure.
            tracing::debug!(message = "spawn: pid pipe closed without a pid", error = ?errno);
            close_pid_pipe(&ctx, &state);
            return;
        }
    };
    close_pid_pipe(&ctx, &state);

    let (what, pidpath) = {
        let mut inner = state.inner.lock();
        inner.inner_pid = Some(pid);
        (inner.what.clone(), inner.pidpath.clone())
    };
    tracing::debug!(message = "spawn: inner pid", what = %what, pid = pid.as_raw());
    let Some(pidpath) = pidpath else {
        return;
    };
    if let Err(err) = ctx.store().write(&pidpath, &pid.as_raw().to_string()) {
        tracing::error!(message = "spawn: unable to record the pid", what = %what, pidpath = %pidpath, error = ?err);
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            tracing::error!(message = "spawn: unable to signal the daemon", pid = pid.as_raw(), error = ?errno);
        }
        state.fail(egc);
    }
}

fn close_pid_pipe(ctx: &Ctx, state: &SpawnState) {
    let pid_rx = {
        let mut inner = state.inner.lock();
        inner.pid_efd.deregister(ctx);
        std::mem::replace(&mut inner.pid_rx, Carefd::none())
    };
    pid_rx.close();
}

fn middle_reaped(
    egc: &mut Egc,
    weak: &Weak<Mutex<SpawnInner>>,
    mid: &Arc<Mutex<MidProc>>,
    pid: Pid,
    status: WaitStatus,
) {
    let detached = {
        let mut it = mid.lock();
        it.reaped = true;
        it.detached
    };
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let state = SpawnState { inner };
    if detached {
        tracing::debug!(message = "spawn: detached middle process reaped", what = %state.what(), pid = pid.as_raw());
        state.forget_middle(mid);
        return;
    }
    report_child_exitstatus(
        Level::ERROR,
        &format!("{} (middle process)", state.what()),
        pid,
        status,
    );
    state.fail(egc);
}

/// In the middle process. Returns only in the inner process.
fn run_middle(pid_tx: Carefd, midproc_cb: Option<&(dyn Fn(Pid) -> Option<Signal> + Send + Sync)>) -> SpawnOutcome {
    // SAFETY: this process has a single thread, and the inner child only allocates and
    // logs before it execs or exits.
    let inner = match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            pid_tx.close();
            return SpawnOutcome::InnerChild;
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            tracing::error!(message = "spawn: unable to fork the inner process", error = ?errno);
            // SAFETY: _exit(2) only terminates this process.
            unsafe { libc::_exit(MIDPROC_FAILED_STATUS) };
        }
    };

    if let Some(midproc_cb) = midproc_cb
        && let Some(signal) = midproc_cb(inner)
    {
        tracing::warn!(message = "spawn: middle process refused the inner process", signal = %signal);
        if let Err(errno) = kill(inner, signal) {
            tracing::error!(message = "spawn: unable to signal the inner process", error = ?errno);
        }
        // SAFETY: _exit(2) only terminates this process.
        unsafe { libc::_exit(MIDPROC_FAILED_STATUS) };
    }

    if let Some(fd) = pid_tx.as_fd()
        && let Err(errno) = rustix::io::write(fd, &inner.as_raw().to_ne_bytes())
    {
        tracing::error!(message = "spawn: unable to report the inner pid", error = ?errno);
    }

    let status = loop {
        match waitpid(inner, None) {
            Err(Errno::EINTR) => {}
            other => break other,
        }
    };
    // SAFETY: _exit(2) only terminates this process.
    unsafe { libc::_exit(middle_exit_code(status)) }
}

/// How the middle process passes on the fate of the inner one.
fn middle_exit_code(status: nix::Result<WaitStatus>) -> i32 {
    match status {
        Ok(WaitStatus::Exited(_, code)) if (0..=127).contains(&code) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => 255,
    }
}
