//! Diagnostic records.
//!
//! While the heap lock is held nothing may call into a logger: a logger that
//! allocates would come back into the allocator and block on the very lock
//! its caller is holding. Records are therefore collected in a [`TraceBuf`]
//! on the stack and only handed to [`log`] once the lock has been dropped.

use std::{cell::Cell, fmt};

/// Upper bound of records a single operation produces: an allocation may
/// acquire a page, split and allocate; a release may free, coalesce twice
/// and trim a page.
const CAPACITY: usize = 8;

pub(crate) const TARGET: &str = "memalloc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Allocate,
    Free,
    Split,
    Coalesce,
    PageAcquire,
    PageRelease,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::Allocate => "allocate",
            Event::Free => "free",
            Event::Split => "split",
            Event::Coalesce => "coalesce",
            Event::PageAcquire => "page-acquire",
            Event::PageRelease => "page-release",
        })
    }
}

/// Fixed size buffer of `(event, bytes)` records. Never allocates.
pub(crate) struct TraceBuf {
    records: [(Event, usize); CAPACITY],
    len: usize,
}

thread_local! {
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

impl TraceBuf {
    pub const fn new() -> Self {
        Self {
            records: [(Event::Allocate, 0); CAPACITY],
            len: 0,
        }
    }

    /// Records an event. Records past the capacity are dropped.
    pub fn push(&mut self, event: Event, bytes: usize) {
        if self.len < CAPACITY {
            self.records[self.len] = (event, bytes);
            self.len += 1;
        }
    }

    pub fn records(&self) -> &[(Event, usize)] {
        &self.records[..self.len]
    }

    /// Hands all records to the installed logger. Must not be called while
    /// the heap lock is held.
    pub fn emit(self) {
        if self.len == 0 || !log::log_enabled!(target: TARGET, log::Level::Trace) {
            return;
        }

        guarded(|| {
            for (event, bytes) in self.records() {
                log::trace!(target: TARGET, "event={event} bytes={bytes}");
            }
        });
    }
}

/// Runs `log` unless this thread is already inside the logger. Allocations
/// made by the logger itself end up in the allocator again; whatever they
/// would log is dropped instead of recursing.
fn guarded(log: impl FnOnce()) {
    let reentrant = LOGGING.try_with(|logging| logging.replace(true)).unwrap_or(true);
    if reentrant {
        return;
    }

    log();

    let _ = LOGGING.try_with(|logging| logging.set(false));
}

pub(crate) fn warn(args: fmt::Arguments<'_>) {
    guarded(|| log::warn!(target: TARGET, "{args}"));
}

pub(crate) fn error(args: fmt::Arguments<'_>) {
    guarded(|| log::error!(target: TARGET, "{args}"));
}
