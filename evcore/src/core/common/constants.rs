// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use std::time::Duration;

/// How long a device model gets to confirm its startup before the spawn fails.
pub const DEVICE_MODEL_START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a guest gets to go away when it is being destroyed.
pub const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of each buffer in a [`Datacopier`]'s chunk queue.
///
/// [`Datacopier`]: crate::Datacopier
pub const DATACOPIER_CHUNK_SIZE: usize = 1000;

/// A [`Datacopier`] stops reading while this many bytes are queued for the write fd,
/// and resumes once the writer has drained below it.
///
/// [`Datacopier`]: crate::Datacopier
pub const DATACOPIER_MAX_BUFFERED: usize = 64 * DATACOPIER_CHUNK_SIZE;

/// Chunk sized reads done by one readiness callback before going back to the loop.
pub const DATACOPIER_READS_PER_CALLBACK: usize = 8;

/// Watch slot tables grow to `(old + 1) * WATCH_SLOT_GROWTH` slots when full.
pub const WATCH_SLOT_GROWTH: usize = 4;
