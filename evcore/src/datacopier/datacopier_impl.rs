// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words egc maxsz copywhat readwhat writewhat errno revents

use super::{DatacopierEnd, DatacopierInternal};
use crate::{CoreError, CoreResult, Ctx, DATACOPIER_CHUNK_SIZE, DATACOPIER_MAX_BUFFERED,
            DATACOPIER_READS_PER_CALLBACK, Egc, EvFd};
use nix::poll::PollFlags;
use parking_lot::Mutex;
use rustix::io::Errno;
use std::{collections::VecDeque,
          fmt,
          io::Write,
          os::fd::{BorrowedFd, RawFd},
          sync::{Arc, Weak}};

/// Called exactly once, with the context lock held, after the copier has been killed.
pub type DatacopierCallback = Box<dyn FnOnce(&mut Egc, DatacopierEnd) + Send>;

/// What to copy. The fds stay owned by the caller and must stay open while the copier
/// is active. Both are switched to non-blocking mode by [`Datacopier::start()`].
pub struct DatacopierConfig {
    pub readfd: RawFd,
    pub writefd: RawFd,
    /// Fail with [`DatacopierInternal::SizeExceeded`] once the input is longer than
    /// this. Only the first `maxsz` bytes are queued and logged.
    pub maxsz: Option<usize>,
    /// Names used in log messages.
    pub copywhat: String,
    pub readwhat: String,
    pub writewhat: String,
    /// Gets a copy of everything read.
    pub log: Option<Box<dyn Write + Send>>,
}

impl DatacopierConfig {
    pub fn new(
        copywhat: impl Into<String>,
        readfd: RawFd,
        readwhat: impl Into<String>,
        writefd: RawFd,
        writewhat: impl Into<String>,
    ) -> Self {
        Self {
            readfd,
            writefd,
            maxsz: None,
            copywhat: copywhat.into(),
            readwhat: readwhat.into(),
            writewhat: writewhat.into(),
            log: None,
        }
    }

    #[must_use]
    pub fn with_maxsz(mut self, maxsz: usize) -> Self {
        self.maxsz = Some(maxsz);
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: impl Write + Send + 'static) -> Self {
        self.log = Some(Box::new(log));
        self
    }
}

/// Copies everything from one fd to another through a queue of
/// [`DATACOPIER_CHUNK_SIZE`] byte buffers, until end of input or the first failure.
///
/// Reading pauses while [`DATACOPIER_MAX_BUFFERED`] bytes are queued, so a slow
/// destination bounds memory instead of growing it.
pub struct Datacopier {
    inner: Arc<Mutex<DcInner>>,
}

struct DcInner {
    config: DatacopierConfig,
    callback: Option<DatacopierCallback>,
    toread: EvFd,
    towrite: EvFd,
    bufs: VecDeque<Chunk>,
    /// Bytes queued and not yet written.
    used: usize,
    total_read: usize,
    eof: bool,
    /// Set while active.
    ctx: Option<Ctx>,
}

struct Chunk {
    data: Vec<u8>,
    written: usize,
}

impl Chunk {
    fn new() -> Self {
        Self {
            data: Vec::with_capacity(DATACOPIER_CHUNK_SIZE),
            written: 0,
        }
    }

    fn is_full(&self) -> bool { self.data.len() >= DATACOPIER_CHUNK_SIZE }

    fn is_drained(&self) -> bool { self.written >= self.data.len() }
}

impl Datacopier {
    #[must_use]
    pub fn new(
        config: DatacopierConfig,
        callback: impl FnOnce(&mut Egc, DatacopierEnd) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DcInner {
                config,
                callback: Some(Box::new(callback)),
                toread: EvFd::new(),
                towrite: EvFd::new(),
                bufs: VecDeque::new(),
                used: 0,
                total_read: 0,
                eof: false,
                ctx: None,
            })),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        let dc = self.inner.lock();
        dc.ctx.is_some() && dc.callback.is_some()
    }

    /// # Errors
    ///
    /// If either fd can't be made non-blocking, or the read side can't be registered.
    /// The copier is killed and the callback will never run.
    pub fn start(&self, ctx: &Ctx) -> CoreResult<()> {
        let _guard = ctx.lock();
        let started = {
            let mut dc = self.inner.lock();
            debug_assert!(dc.ctx.is_none(), "datacopier started twice");
            dc.ctx = Some(ctx.clone());
            let (readfd, writefd) = (dc.config.readfd, dc.config.writefd);
            let weak = Arc::downgrade(&self.inner);
            set_nonblocking(readfd, "reading")
                .and_then(|()| set_nonblocking(writefd, "writing"))
                .and_then(|()| watch_reader(&mut dc, ctx, &weak))
        };
        match started {
            Ok(()) => {
                let dc = self.inner.lock();
                tracing::debug!(
                    message = "datacopier start",
                    copywhat = %dc.config.copywhat,
                    readfd = dc.config.readfd,
                    writefd = dc.config.writefd,
                    maxsz = ?dc.config.maxsz
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(message = "datacopier start failed", error = ?err);
                drop(self.take_for_kill());
                Err(err)
            }
        }
    }

    /// Stops copying. The callback will not run. Idempotent.
    pub fn kill(&self) { drop(self.take_for_kill()); }

    /// Deregisters everything and hands back the callback, if it hasn't run yet.
    fn take_for_kill(&self) -> Option<DatacopierCallback> {
        let ctx = self.inner.lock().ctx.take()?;
        let _guard = ctx.lock();
        let mut dc = self.inner.lock();
        dc.toread.deregister(&ctx);
        dc.towrite.deregister(&ctx);
        dc.bufs.clear();
        dc.used = 0;
        dc.callback.take()
    }
}

impl Drop for Datacopier {
    fn drop(&mut self) { self.kill(); }
}

impl fmt::Debug for Datacopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dc = self.inner.lock();
        f.debug_struct("Datacopier")
            .field("copywhat", &dc.config.copywhat)
            .field("used", &dc.used)
            .field("total_read", &dc.total_read)
            .field("eof", &dc.eof)
            .field("active", &dc.ctx.is_some())
            .finish()
    }
}

fn set_nonblocking(fd: RawFd, what: &str) -> CoreResult<()> {
    // SAFETY: the caller keeps the fd open while the copier is active.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    rustix::io::ioctl_fionbio(fd, true).map_err(|errno| {
        CoreError::errno(
            format!("making the fd for {what} non-blocking"),
            errno.raw_os_error(),
        )
    })
}

fn readable(egc: &mut Egc, weak: &Weak<Mutex<DcInner>>, revents: PollFlags) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
        tracing::error!(message = "datacopier: unexpected poll event on the read fd", revents = ?revents);
        finish(egc, &inner, DatacopierEnd::Internal(DatacopierInternal::UnexpectedPollEvent));
        return;
    }

    let ctx = egc.ctx().clone();
    let ended = {
        let mut guard = inner.lock();
        let dc = &mut *guard;
        match read_some(dc) {
            Some(end) => Some(end),
            None if dc.eof && dc.used == 0 => Some(DatacopierEnd::Eof),
            None => {
                if dc.eof || dc.used >= DATACOPIER_MAX_BUFFERED {
                    dc.toread.deregister(&ctx);
                }
                arm_writer(dc, &ctx, weak)
            }
        }
    };
    if let Some(end) = ended {
        finish(egc, &inner, end);
    }
}

/// Reads until the fd would block, end of input, or a failure. Stops early after
/// [`DATACOPIER_READS_PER_CALLBACK`] reads, or once [`DATACOPIER_MAX_BUFFERED`] bytes
/// are queued.
fn read_some(dc: &mut DcInner) -> Option<DatacopierEnd> {
    // SAFETY: the caller keeps the fd open while the copier is active.
    let fd = unsafe { BorrowedFd::borrow_raw(dc.config.readfd) };
    let mut buf = [0_u8; DATACOPIER_CHUNK_SIZE];
    let mut reads = 0;
    while reads < DATACOPIER_READS_PER_CALLBACK && dc.used < DATACOPIER_MAX_BUFFERED {
        if dc.bufs.back().is_none_or(Chunk::is_full) {
            dc.bufs.push_back(Chunk::new());
        }
        let Some(chunk) = dc.bufs.back_mut() else {
            return Some(DatacopierEnd::Internal(DatacopierInternal::Registration));
        };
        let room =
            (DATACOPIER_CHUNK_SIZE - chunk.data.len()).min(DATACOPIER_MAX_BUFFERED - dc.used);
        match rustix::io::read(fd, &mut buf[..room]) {
            Ok(0) => {
                if chunk.data.is_empty() {
                    dc.bufs.pop_back();
                }
                dc.eof = true;
                return None;
            }
            Ok(got) => {
                reads += 1;
                // Bytes past maxsz are dropped, so the output and the log copy end at
                // the same offset.
                let keep = match dc.config.maxsz {
                    Some(maxsz) => got.min(maxsz.saturating_sub(dc.total_read)),
                    None => got,
                };
                chunk.data.extend_from_slice(&buf[..keep]);
                dc.used += keep;
                dc.total_read += keep;
                if let Some(log) = dc.config.log.as_mut()
                    && let Err(err) = log.write_all(&buf[..keep])
                {
                    tracing::error!(message = "datacopier: error writing the log copy", copywhat = %dc.config.copywhat, error = ?err);
                    return Some(DatacopierEnd::LogError(err.raw_os_error().unwrap_or(libc::EIO)));
                }
                if keep < got
                    && let Some(maxsz) = dc.config.maxsz
                {
                    tracing::error!(
                        message = "datacopier: input is too large",
                        copywhat = %dc.config.copywhat,
                        readwhat = %dc.config.readwhat,
                        maxsz = maxsz
                    );
                    return Some(DatacopierEnd::Internal(DatacopierInternal::SizeExceeded));
                }
            }
            Err(Errno::AGAIN) => return None,
            Err(Errno::INTR) => {}
            Err(errno) => {
                tracing::error!(
                    message = "datacopier: error reading",
                    copywhat = %dc.config.copywhat,
                    readwhat = %dc.config.readwhat,
                    error = ?errno
                );
                return Some(DatacopierEnd::ReadError(errno.raw_os_error()));
            }
        }
    }
    None
}

fn watch_reader(dc: &mut DcInner, ctx: &Ctx, weak: &Weak<Mutex<DcInner>>) -> CoreResult<()> {
    let weak = weak.clone();
    dc.toread.register(
        ctx,
        move |egc: &mut Egc, _: RawFd, _: PollFlags, revents: PollFlags| {
            readable(egc, &weak, revents);
        },
        dc.config.readfd,
        PollFlags::POLLIN,
    )
}

/// Resumes reading once the queue has drained below [`DATACOPIER_MAX_BUFFERED`].
fn arm_reader(dc: &mut DcInner, ctx: &Ctx, weak: &Weak<Mutex<DcInner>>) -> Option<DatacopierEnd> {
    if dc.eof || dc.used >= DATACOPIER_MAX_BUFFERED || dc.toread.is_registered() {
        return None;
    }
    match watch_reader(dc, ctx, weak) {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(message = "datacopier: unable to watch the read fd", error = ?err);
            Some(DatacopierEnd::Internal(DatacopierInternal::Registration))
        }
    }
}

/// Registers interest in the write fd if there is something to write.
fn arm_writer(dc: &mut DcInner, ctx: &Ctx, weak: &Weak<Mutex<DcInner>>) -> Option<DatacopierEnd> {
    if dc.used == 0 || dc.towrite.is_registered() {
        return None;
    }
    let weak = weak.clone();
    let registered = dc.towrite.register(
        ctx,
        move |egc: &mut Egc, _: RawFd, _: PollFlags, revents: PollFlags| {
            writable(egc, &weak, revents);
        },
        dc.config.writefd,
        PollFlags::POLLOUT,
    );
    match registered {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(message = "datacopier: unable to watch the write fd", error = ?err);
            Some(DatacopierEnd::Internal(DatacopierInternal::Registration))
        }
    }
}

fn writable(egc: &mut Egc, weak: &Weak<Mutex<DcInner>>, revents: PollFlags) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        tracing::error!(message = "datacopier: unexpected poll event on the write fd", revents = ?revents);
        finish(egc, &inner, DatacopierEnd::Internal(DatacopierInternal::UnexpectedPollEvent));
        return;
    }

    let ctx = egc.ctx().clone();
    let ended = {
        let mut guard = inner.lock();
        let dc = &mut *guard;
        match write_all(dc) {
            Some(end) => Some(end),
            None if dc.used == 0 && dc.eof => Some(DatacopierEnd::Eof),
            None => {
                if dc.used == 0 {
                    dc.towrite.deregister(&ctx);
                }
                arm_reader(dc, &ctx, weak)
            }
        }
    };
    if let Some(end) = ended {
        finish(egc, &inner, end);
    }
}

/// Writes queued chunks until the fd would block, the queue is empty, or a failure.
fn write_all(dc: &mut DcInner) -> Option<DatacopierEnd> {
    // SAFETY: the caller keeps the fd open while the copier is active.
    let fd = unsafe { BorrowedFd::borrow_raw(dc.config.writefd) };
    loop {
        let Some(chunk) = dc.bufs.front_mut() else {
            return None;
        };
        if chunk.is_drained() {
            dc.bufs.pop_front();
            continue;
        }
        match rustix::io::write(fd, &chunk.data[chunk.written..]) {
            Ok(wrote) => {
                chunk.written += wrote;
                dc.used -= wrote;
            }
            Err(Errno::AGAIN) => return None,
            Err(Errno::INTR) => {}
            Err(errno) => {
                tracing::error!(
                    message = "datacopier: error writing",
                    copywhat = %dc.config.copywhat,
                    writewhat = %dc.config.writewhat,
                    error = ?errno
                );
                return Some(DatacopierEnd::WriteError(errno.raw_os_error()));
            }
        }
    }
}

/// Kills the copier, then runs the callback.
fn finish(egc: &mut Egc, inner: &Arc<Mutex<DcInner>>, end: DatacopierEnd) {
    let callback = {
        let mut dc = inner.lock();
        let ctx = egc.ctx().clone();
        dc.toread.deregister(&ctx);
        dc.towrite.deregister(&ctx);
        dc.bufs.clear();
        dc.used = 0;
        dc.ctx = None;
        tracing::debug!(
            message = "datacopier finished",
            copywhat = %dc.config.copywhat,
            end = ?end,
            total_read = dc.total_read
        );
        dc.callback.take()
    };
    if let Some(callback) = callback {
        callback(egc, end);
    }
}
