// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use std::sync::{Arc,
                atomic::{AtomicBool, Ordering}};

/// Identifies one registration in the context's tables. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvId(pub(crate) u64);

impl EvId {
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

/// What a registration handle keeps to find its record again.
///
/// `live` is shared with the record. The core clears it when a registration ends on
/// its own (a timer firing, a child being reaped), so the handle reads as Idle without
/// having to be told.
#[derive(Debug)]
pub(crate) struct RegLink {
    pub(crate) id: EvId,
    pub(crate) live: Arc<AtomicBool>,
}

impl RegLink {
    pub(crate) fn new(id: EvId) -> (Self, Arc<AtomicBool>) {
        let live = Arc::new(AtomicBool::new(true));
        (
            Self {
                id,
                live: live.clone(),
            },
            live,
        )
    }

    pub(crate) fn is_live(&self) -> bool { self.live.load(Ordering::SeqCst) }

    /// Marks the registration dead. Returns whether it was live.
    pub(crate) fn kill(&self) -> bool { self.live.swap(false, Ordering::SeqCst) }
}
