// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words unwatch unreadable

use super::{ConfigStore, StoreError, WatchEvent};
use mio::unix::pipe;
use parking_lot::Mutex;
use std::{collections::{BTreeMap, BTreeSet, VecDeque},
          io::{self, Read as _, Write as _},
          os::fd::{AsRawFd as _, RawFd}};

/// An in-process [`ConfigStore`]. Used by tests, and by embedders that run without a real
/// store daemon.
///
/// Pending watch events are signalled through a [`mio::unix::pipe`]: the pipe holds one
/// byte while the event queue is non-empty.
#[derive(Debug)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
    notify_tx: pipe::Sender,
    notify_rx: pipe::Receiver,
}

#[derive(Debug, Default)]
struct MemStoreInner {
    nodes: BTreeMap<String, String>,
    /// `(path, token)` pairs.
    watches: BTreeSet<(String, String)>,
    pending: VecDeque<WatchEvent>,
    unreadable: BTreeSet<String>,
}

impl MemStore {
    /// # Errors
    ///
    /// If the notification pipe can't be created.
    pub fn try_new() -> Result<Self, StoreError> {
        let (notify_tx, notify_rx) = pipe::new().map_err(|source| StoreError::Io {
            context: "creating the watch notification pipe".into(),
            source,
        })?;
        Ok(Self {
            inner: Mutex::new(MemStoreInner::default()),
            notify_tx,
            notify_rx,
        })
    }

    /// Makes every later [`read()`](ConfigStore::read) of `path` fail with
    /// [`StoreError::Permission`]. Watches still fire.
    pub fn set_unreadable(&self, path: &str) {
        self.inner.lock().unreadable.insert(path.to_string());
    }

    /// Number of watches currently registered.
    #[must_use]
    pub fn watch_count(&self) -> usize { self.inner.lock().watches.len() }

    fn queue_locked(&self, inner: &mut MemStoreInner, event: WatchEvent) {
        let was_empty = inner.pending.is_empty();
        inner.pending.push_back(event);
        if was_empty {
            match (&self.notify_tx).write(&[1]) {
                Ok(_) => {}
                // Full pipe is still readable.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!(message = "store notification write failed", error = ?err);
                }
            }
        }
    }

    /// Queues an event for every watch that covers `changed`.
    fn fire_locked(&self, inner: &mut MemStoreInner, changed: &str, removal: bool) {
        let hits: Vec<String> = inner
            .watches
            .iter()
            .filter(|(path, _)| {
                is_at_or_below(changed, path) || (removal && is_at_or_below(path, changed))
            })
            .map(|(_, token)| token.clone())
            .collect();
        for token in hits {
            self.queue_locked(
                inner,
                WatchEvent {
                    path: changed.to_string(),
                    token,
                },
            );
        }
    }

    fn drain_notify_pipe(&self) {
        let mut buf = [0_u8; 64];
        loop {
            match (&self.notify_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }
}

fn is_at_or_below(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || ancestor.ends_with('/'),
        None => false,
    }
}

impl ConfigStore for MemStore {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock();
        if inner.unreadable.contains(path) {
            return Err(StoreError::Permission {
                path: path.to_string(),
            });
        }
        Ok(inner.nodes.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.nodes.insert(path.to_string(), value.to_string());
        self.fire_locked(&mut inner, path, false);
        Ok(())
    }

    fn rm(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let doomed: Vec<String> = inner
            .nodes
            .keys()
            .filter(|it| is_at_or_below(it, path))
            .cloned()
            .collect();
        for it in &doomed {
            inner.nodes.remove(it);
        }
        self.fire_locked(&mut inner, path, true);
        Ok(())
    }

    fn directory(&self, path: &str) -> Result<Option<Vec<String>>, StoreError> {
        let inner = self.inner.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = inner
            .nodes
            .keys()
            .filter_map(|it| it.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|it| !it.is_empty())
            .map(str::to_string)
            .collect();
        if children.is_empty() && !inner.nodes.contains_key(path) {
            return Ok(None);
        }
        Ok(Some(children.into_iter().collect()))
    }

    fn watch(&self, path: &str, token: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.watches.insert((path.to_string(), token.to_string()));
        // A new watch always fires once.
        self.queue_locked(
            &mut inner,
            WatchEvent {
                path: path.to_string(),
                token: token.to_string(),
            },
        );
        Ok(())
    }

    fn unwatch(&self, path: &str, token: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let key = (path.to_string(), token.to_string());
        if !inner.watches.remove(&key) {
            return Err(StoreError::NoSuchWatch {
                path: key.0,
                token: key.1,
            });
        }
        Ok(())
    }

    fn watch_fd(&self) -> RawFd { self.notify_rx.as_raw_fd() }

    fn check_watch(&self) -> Result<Option<WatchEvent>, StoreError> {
        let mut inner = self.inner.lock();
        let next = inner.pending.pop_front();
        if inner.pending.is_empty() {
            self.drain_notify_pipe();
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(store: &MemStore) -> Vec<WatchEvent> {
        std::iter::from_fn(|| store.check_watch().unwrap()).collect()
    }

    fn ev(path: &str, token: &str) -> WatchEvent {
        WatchEvent {
            path: path.into(),
            token: token.into(),
        }
    }

    #[test]
    fn read_write_rm() {
        let store = MemStore::try_new().unwrap();
        assert_eq!(store.read("/a").unwrap(), None);
        store.write("/a/b", "1").unwrap();
        store.write("/a/c/d", "2").unwrap();
        assert_eq!(store.read("/a/b").unwrap().as_deref(), Some("1"));
        assert_eq!(
            store.directory("/a").unwrap(),
            Some(vec!["b".to_string(), "c".to_string()])
        );
        assert_eq!(store.directory("/nope").unwrap(), None);

        store.rm("/a").unwrap();
        assert_eq!(store.read("/a/c/d").unwrap(), None);
        // Absent paths can be removed.
        store.rm("/a").unwrap();
    }

    #[test]
    fn watch_fires_once_then_on_changes_at_or_below() {
        let store = MemStore::try_new().unwrap();
        store.watch("/dom/1", "0/0").unwrap();
        assert_eq!(drain(&store), vec![ev("/dom/1", "0/0")]);

        store.write("/dom/1/state", "4").unwrap();
        store.write("/dom/10", "x").unwrap();
        store.write("/dom", "x").unwrap();
        assert_eq!(drain(&store), vec![ev("/dom/1/state", "0/0")]);

        // Removing an ancestor fires too.
        store.rm("/dom").unwrap();
        assert_eq!(drain(&store), vec![ev("/dom", "0/0")]);

        store.unwatch("/dom/1", "0/0").unwrap();
        store.write("/dom/1", "y").unwrap();
        assert!(drain(&store).is_empty());
        assert!(store.unwatch("/dom/1", "0/0").is_err());
    }

    #[test]
    fn notify_fd_is_readable_only_while_events_are_pending() {
        let store = MemStore::try_new().unwrap();
        let readable = |store: &MemStore| {
            let mut fds = [libc::pollfd {
                fd: store.watch_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            // SAFETY: one valid pollfd, zero timeout.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 0) };
            rc == 1
        };

        assert!(!readable(&store));
        store.watch("/x", "t").unwrap();
        assert!(readable(&store));
        drain(&store);
        assert!(!readable(&store));
    }

    #[test]
    fn unreadable_paths_report_permission() {
        let store = MemStore::try_new().unwrap();
        store.write("/secret", "1").unwrap();
        store.set_unreadable("/secret");
        let err = store.read("/secret").unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
    }
}
