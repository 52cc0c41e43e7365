// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words zalloc strdup sprintf nmemb egc

//! Region allocation for one call frame. See [`Pool`].

use std::{any::Any,
          borrow::Cow,
          cell::RefCell,
          fmt,
          ops::{Deref, DerefMut}};

/// An arena whose contents are all released together, when the region it belongs to
/// ends.
///
/// Every [`Egc`] embeds one (freed when the egc is delivered), and every [`Ao`] embeds
/// one (freed when the operation is destroyed). Things allocated here are handed out as
/// references that borrow the pool, so they can't outlive it; to keep something past the
/// end of the region, clone it out.
///
/// - [`free_all()`] releases every allocation exactly once. Calling it again, or dropping
///   the pool afterwards, is a no-op.
/// - Allocation failure is fatal. It is logged and the process aborts (see
///   [`alloc_failed()`]). Nothing built on top of a pool has a way to unwind a
///   half-finished registration without allocating.
///
/// [`Ao`]: crate::Ao
/// [`Egc`]: crate::Egc
/// [`free_all()`]: Self::free_all
#[derive(Default)]
pub struct Pool {
    allocations: RefCell<Vec<Tracked>>,
}

/// Type-erased owner of one allocation. Created by `Box::into_raw` and turned back into a
/// `Box` exactly once, in [`Pool::free_all()`].
struct Tracked(*mut (dyn Any + Send));

// SAFETY: the pointee is `Send`, and the pointer is uniquely owned by the pool.
unsafe impl Send for Tracked {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("len", &self.len()).finish()
    }
}

impl Pool {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize { self.allocations.borrow().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Moves `value` into the pool and returns a reference to it that lives as long as
    /// this borrow of the pool.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T: Send + 'static>(&self, value: T) -> &mut T {
        let mut allocations = self.allocations.borrow_mut();
        if allocations.try_reserve(1).is_err() {
            alloc_failed("Pool::alloc", 1, std::mem::size_of::<Tracked>());
        }
        let raw: *mut T = Box::into_raw(Box::new(value));
        allocations.push(Tracked(raw as *mut (dyn Any + Send)));
        // SAFETY: `raw` came from `Box::into_raw` above, so it is valid and unaliased.
        // Its heap block is only freed by `free_all(&mut self)`, which can't run while
        // the returned borrow of `self` is alive.
        unsafe { &mut *raw }
    }

    /// Zero-filled bytes.
    #[allow(clippy::mut_from_ref)]
    pub fn zalloc(&self, size: usize) -> &mut [u8] {
        let mut bytes = try_vec::<u8>(size, "Pool::zalloc");
        bytes.resize(size, 0);
        self.alloc(bytes).as_mut_slice()
    }

    /// Returns a new slice of `new_len` elements starting with a copy of `old`. Elements
    /// past the end of `old` are `T::default()`. The old slice stays valid until the pool
    /// is freed.
    #[allow(clippy::mut_from_ref)]
    pub fn reallocate<T>(&self, old: &[T], new_len: usize) -> &mut [T]
    where
        T: Clone + Default + Send + 'static,
    {
        let mut it = try_vec::<T>(new_len, "Pool::reallocate");
        let keep = old.len().min(new_len);
        it.extend_from_slice(&old[..keep]);
        it.resize(new_len, T::default());
        self.alloc(it).as_mut_slice()
    }

    pub fn strdup(&self, s: &str) -> &str {
        let mut it = String::new();
        if it.try_reserve_exact(s.len()).is_err() {
            alloc_failed("Pool::strdup", s.len(), 1);
        }
        it.push_str(s);
        self.alloc(it).as_str()
    }

    /// Formats into the pool, eg: `pool.sprintf(format_args!("{base}/{leaf}"))`.
    pub fn sprintf(&self, args: fmt::Arguments<'_>) -> &str {
        self.alloc(fmt::format(args)).as_str()
    }

    /// Releases every allocation, exactly once. Idempotent.
    pub fn free_all(&mut self) {
        let allocations = std::mem::take(self.allocations.get_mut());
        for Tracked(raw) in allocations {
            // SAFETY: each pointer came from `Box::into_raw` in `alloc()` and is removed
            // from the list before being freed, so it is freed only once.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) { self.free_all(); }
}

/// Logs and aborts. There is no recovery from allocation failure.
pub fn alloc_failed(func: &str, nmemb: usize, size: usize) -> ! {
    tracing::error!(
        message = "allocation failure, aborting",
        func = func,
        nmemb = nmemb,
        size = size,
    );
    std::process::abort()
}

fn try_vec<T>(len: usize, func: &str) -> Vec<T> {
    let mut it = Vec::new();
    if it.try_reserve_exact(len).is_err() {
        alloc_failed(func, len, std::mem::size_of::<T>());
    }
    it
}

/// Bytes from [`zalloc()`]: either borrowed from a pool, or owned by the caller when no
/// pool was supplied.
#[derive(Debug)]
pub enum PoolBytes<'p> {
    Pooled(&'p mut [u8]),
    Owned(Vec<u8>),
}

impl Deref for PoolBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            PoolBytes::Pooled(it) => it,
            PoolBytes::Owned(it) => it.as_slice(),
        }
    }
}

impl DerefMut for PoolBytes<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            PoolBytes::Pooled(it) => it,
            PoolBytes::Owned(it) => it.as_mut_slice(),
        }
    }
}

/// Zero-filled bytes from `pool`, or owned by the caller if `pool` is [`None`].
#[must_use]
pub fn zalloc(pool: Option<&Pool>, size: usize) -> PoolBytes<'_> {
    match pool {
        Some(pool) => PoolBytes::Pooled(pool.zalloc(size)),
        None => {
            let mut it = try_vec::<u8>(size, "zalloc");
            it.resize(size, 0);
            PoolBytes::Owned(it)
        }
    }
}

/// Copies `s` into `pool`, or into a caller-owned [`String`] if `pool` is [`None`].
#[must_use]
pub fn strdup<'p>(pool: Option<&'p Pool>, s: &str) -> Cow<'p, str> {
    match pool {
        Some(pool) => Cow::Borrowed(pool.strdup(s)),
        None => Cow::Owned(s.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc,
                    atomic::{AtomicUsize, Ordering}};

    struct CountDrops(Arc<AtomicUsize>);

    impl Drop for CountDrops {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    #[test]
    fn free_all_releases_each_allocation_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = Pool::new();
        for _ in 0..5 {
            pool.alloc(CountDrops(drops.clone()));
        }
        assert_eq!(pool.len(), 5);

        pool.free_all();
        assert_eq!(drops.load(Ordering::SeqCst), 5);
        assert!(pool.is_empty());

        // Idempotent, and the later drop frees nothing more.
        pool.free_all();
        drop(pool);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn drop_frees_the_region() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pool = Pool::new();
            pool.alloc(CountDrops(drops.clone()));
            pool.alloc(CountDrops(drops.clone()));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn strings_and_bytes() {
        let pool = Pool::new();
        let path = pool.strdup("/local/domain/7");
        let node = pool.sprintf(format_args!("{path}/device-model"));
        assert_eq!(node, "/local/domain/7/device-model");

        let bytes = pool.zalloc(16);
        assert!(bytes.iter().all(|it| *it == 0));
        bytes[0] = 42;

        let bigger = pool.reallocate(bytes, 20);
        assert_eq!(bigger.len(), 20);
        assert_eq!(bigger[0], 42);
        assert_eq!(bigger[19], 0);

        let smaller = pool.reallocate(&[1_u32, 2, 3], 2);
        assert_eq!(smaller, &[1, 2]);

        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn without_a_pool_the_caller_owns_the_result() {
        let owned = zalloc(None, 4);
        assert!(matches!(owned, PoolBytes::Owned(_)));
        assert_eq!(&*owned, &[0, 0, 0, 0]);

        let it = strdup(None, "xs");
        assert!(matches!(it, Cow::Owned(_)));

        let pool = Pool::new();
        let it = strdup(Some(&pool), "xs");
        assert!(matches!(it, Cow::Borrowed("xs")));
        let mut bytes = zalloc(Some(&pool), 3);
        bytes[2] = 1;
        assert_eq!(&*bytes, &[0, 0, 1]);
    }
}
