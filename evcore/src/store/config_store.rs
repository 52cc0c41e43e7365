// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words unwatch errno

use miette::Diagnostic;
use std::os::fd::RawFd;

/// A path-hierarchical key/value store with watches.
///
/// Every call is fast and synchronous. The transactional protocol of a real store is
/// out of scope here; implementations decide how each call maps onto it.
///
/// # Watches
///
/// [`watch()`] subscribes to a path and its descendants under an opaque `token`. When a
/// watched path changes, the store makes [`watch_fd()`] readable; the event loop then
/// calls [`check_watch()`] until it returns `Ok(None)`. Each [`WatchEvent`] carries the
/// path that changed and the token it was registered with. A freshly registered watch
/// fires once straight away, whether or not the path exists.
///
/// [`check_watch()`]: ConfigStore::check_watch
/// [`watch()`]: ConfigStore::watch
/// [`watch_fd()`]: ConfigStore::watch_fd
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` if the path doesn't exist.
    ///
    /// # Errors
    ///
    /// Any failure other than absence.
    fn read(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// If the value can't be stored.
    fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Removes `path` and everything below it. Removing an absent path succeeds.
    ///
    /// # Errors
    ///
    /// If the removal can't be carried out.
    fn rm(&self, path: &str) -> Result<(), StoreError>;

    /// Names of the immediate children of `path`, or `Ok(None)` if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Any failure other than absence.
    fn directory(&self, path: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// # Errors
    ///
    /// If the watch can't be set up.
    fn watch(&self, path: &str, token: &str) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// If no such watch exists, or it can't be removed.
    fn unwatch(&self, path: &str, token: &str) -> Result<(), StoreError>;

    /// The fd that becomes readable when [`check_watch()`](Self::check_watch) has
    /// something to return.
    fn watch_fd(&self) -> RawFd;

    /// Next pending watch event, or `Ok(None)` once there are none left.
    ///
    /// # Errors
    ///
    /// If the store connection is broken. The caller treats this as a disaster.
    fn check_watch(&self) -> Result<Option<WatchEvent>, StoreError>;
}

/// One watch firing, as read back by [`ConfigStore::check_watch()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// The path that changed. Equal to, or below, the watched path.
    pub path: String,
    pub token: String,
}

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum StoreError {
    #[error("store i/o failed while {context}")]
    #[diagnostic(code(gmctl_evcore::store::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("permission denied for {path}")]
    #[diagnostic(
        code(gmctl_evcore::store::permission),
        help("The path exists but the caller isn't allowed to access it")
    )]
    Permission { path: String },

    #[error("no watch on {path} with token {token}")]
    #[diagnostic(code(gmctl_evcore::store::no_such_watch))]
    NoSuchWatch { path: String, token: String },
}

impl StoreError {
    /// The errno a C store client would have reported for this failure.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            StoreError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            StoreError::Permission { .. } => libc::EACCES,
            StoreError::NoSuchWatch { .. } => libc::ENOENT,
        }
    }
}
