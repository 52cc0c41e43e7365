// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words domid vdev

use strum::IntoEnumIterator as _;
use strum_macros::{Display, EnumDiscriminants, EnumIter};

/// Something the application is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub domid: u32,
    /// Copied from the request that caused the event, so the application can match them
    /// up.
    pub for_user: u64,
    pub kind: EventKind,
}

impl Event {
    #[must_use]
    pub fn new(domid: u32, for_user: u64, kind: EventKind) -> Self {
        Self {
            domid,
            for_user,
            kind,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> EventType { EventType::from(&self.kind) }
}

#[derive(Debug, Clone, PartialEq, Eq, EnumDiscriminants)]
#[strum_discriminants(
    name(EventType),
    derive(Hash, PartialOrd, Ord, EnumIter, Display)
)]
pub enum EventKind {
    DomainShutdown { shutdown_reason: u8 },
    DomainDeath,
    DiskEject { vdev: String },
    /// An async operation started with `AsyncopHow::Event` has finished.
    OperationComplete { rc: i32 },
    DomainCreateConsoleAvailable,
    /// A watched store path was seen holding an intermediate value.
    StateObserved { path: String, value: String },
}

/// A set of [`EventType`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u64);

impl EventMask {
    #[must_use]
    pub fn none() -> Self { Self(0) }

    #[must_use]
    pub fn all() -> Self { EventType::iter().fold(Self::none(), Self::with) }

    #[must_use]
    pub fn of(types: &[EventType]) -> Self {
        types.iter().copied().fold(Self::none(), Self::with)
    }

    #[must_use]
    pub fn with(self, it: EventType) -> Self { Self(self.0 | bit(it)) }

    #[must_use]
    pub fn contains(self, it: EventType) -> bool { self.0 & bit(it) != 0 }
}

fn bit(it: EventType) -> u64 { 1 << (it as u32) }
