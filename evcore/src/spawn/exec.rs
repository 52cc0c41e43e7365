// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words execvp sigprocmask

use nix::{sys::{signal::{SigHandler, SigSet, SigmaskHow, Signal, sigprocmask, signal},
                wait::WaitStatus},
          unistd::{Pid, dup2, execvp}};
use std::{ffi::CString, os::fd::RawFd};
use tracing::Level;

/// Exit status of a child whose exec failed, as a shell would report it.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// For a freshly forked child: wires up stdio, puts signal handling back to how a new
/// program expects it, and execs `argv[0]` (looked up on `PATH`) with `argv`. Extra
/// `env` entries are added to the inherited environment.
///
/// Never returns. If anything fails the reason is logged and the child exits with
/// [`EXEC_FAILED_STATUS`].
pub fn exec(
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
    argv: &[&str],
    env: &[(&str, &str)],
) -> ! {
    for (fd, target) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
        let Some(fd) = fd else {
            continue;
        };
        if fd != target
            && let Err(errno) = dup2(fd, target)
        {
            tracing::error!(message = "exec: dup2 failed", fd = fd, target = target, error = ?errno);
            // SAFETY: _exit(2) only terminates this process.
            unsafe { libc::_exit(EXEC_FAILED_STATUS) };
        }
    }

    // Nothing the library blocked or ignored should leak into the new program.
    if let Err(errno) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
        tracing::error!(message = "exec: unable to restore the signal mask", error = ?errno);
    }
    // SAFETY: SIG_DFL installs no Rust code as a handler.
    if let Err(errno) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        tracing::error!(message = "exec: unable to reset SIGPIPE", error = ?errno);
    }

    for (key, value) in env {
        // SAFETY: a forked child has only this thread.
        unsafe { std::env::set_var(key, value) };
    }

    let args: Result<Vec<CString>, _> = argv.iter().map(|it| CString::new(*it)).collect();
    let args = match args {
        Ok(args) if !args.is_empty() => args,
        Ok(_) => {
            tracing::error!(message = "exec: no program given");
            // SAFETY: _exit(2) only terminates this process.
            unsafe { libc::_exit(EXEC_FAILED_STATUS) };
        }
        Err(err) => {
            tracing::error!(message = "exec: argument contains NUL", error = ?err);
            // SAFETY: _exit(2) only terminates this process.
            unsafe { libc::_exit(EXEC_FAILED_STATUS) };
        }
    };

    let Err(errno) = execvp(&args[0], &args);
    tracing::error!(message = "exec failed", program = argv[0], error = ?errno);
    // SAFETY: _exit(2) only terminates this process.
    unsafe { libc::_exit(EXEC_FAILED_STATUS) }
}

/// What a wait status means, in words.
#[must_use]
pub fn describe_exitstatus(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, 0) => "unexpectedly exited status zero".to_string(),
        WaitStatus::Exited(_, code) => format!("exited with error status {code}"),
        WaitStatus::Signaled(_, sig, core_dumped) => format!(
            "died due to fatal signal {}{}",
            sig.as_str(),
            if core_dumped { " (core dumped)" } else { "" }
        ),
        other => format!("unexpected wait status {other:?}"),
    }
}

/// Logs how child `what` ended, at `level`.
pub fn report_child_exitstatus(level: Level, what: &str, pid: Pid, status: WaitStatus) {
    let description = describe_exitstatus(status);
    let pid = pid.as_raw();
    match level {
        Level::ERROR => tracing::error!(message = "child process ended", what = what, pid = pid, status = %description),
        Level::WARN => tracing::warn!(message = "child process ended", what = what, pid = pid, status = %description),
        Level::INFO => tracing::info!(message = "child process ended", what = what, pid = pid, status = %description),
        Level::DEBUG => tracing::debug!(message = "child process ended", what = what, pid = pid, status = %description),
        _ => tracing::trace!(message = "child process ended", what = what, pid = pid, status = %description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvChild, ForkOutcome,
                core::test_fixtures::{drive_until, new_test_ctx, pipe_pair}};
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::{io::Read as _,
              os::fd::{AsRawFd as _, OwnedFd},
              sync::{Arc, Mutex},
              time::Duration};
    use test_case::test_case;

    fn pid() -> Pid { Pid::from_raw(42) }

    #[test_case(WaitStatus::Exited(pid(), 0), "unexpectedly exited status zero")]
    #[test_case(WaitStatus::Exited(pid(), 3), "exited with error status 3")]
    #[test_case(WaitStatus::Signaled(pid(), Signal::SIGKILL, false), "died due to fatal signal SIGKILL")]
    #[test_case(WaitStatus::Signaled(pid(), Signal::SIGSEGV, true), "died due to fatal signal SIGSEGV (core dumped)")]
    #[test_case(WaitStatus::Stopped(pid(), Signal::SIGSTOP), "unexpected wait status Stopped(Pid(42), SIGSTOP)")]
    fn describes_wait_statuses(status: WaitStatus, expected: &str) {
        assert_eq!(describe_exitstatus(status), expected);
    }

    fn run_child(argv: &'static [&'static str], stdout: Option<OwnedFd>) -> WaitStatus {
        let (ctx, _store) = new_test_ctx();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        let mut child = EvChild::new();
        let outcome = child
            .fork(&ctx, move |_, _, status| *seen_cb.lock().unwrap() = Some(status))
            .unwrap();
        if outcome == ForkOutcome::Child {
            exec(None, stdout.as_ref().map(|it| it.as_raw_fd()), None, argv, &[("EVCORE_TEST", "yes")]);
        }
        drop(stdout);
        assert!(drive_until(&ctx, Duration::from_secs(10), || seen.lock().unwrap().is_some()));
        seen.lock().unwrap().take().unwrap()
    }

    #[test]
    #[serial]
    fn execs_with_redirected_stdout_and_extra_env() {
        let (read_end, write_end) = pipe_pair();
        let status = run_child(&["sh", "-c", "echo \"hi $EVCORE_TEST\""], Some(write_end));
        assert!(matches!(status, WaitStatus::Exited(_, 0)));

        let mut out = String::new();
        std::fs::File::from(read_end).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi yes\n");
    }

    #[test]
    #[serial]
    fn failed_exec_exits_127() {
        let status = run_child(&["/nonexistent/evcore-test-program"], None);
        assert!(matches!(status, WaitStatus::Exited(_, EXEC_FAILED_STATUS)));
    }
}
