//! Event model and the sink interface.
//!
//! Events form a strict total order consistent with the host scheduler's
//! interleaving: no buffering or reordering happens between a notification
//! and its emission. Each event is stamped with the emitting thread's POSIX
//! identity and the instruction count accumulated since that thread's last
//! event.

use std::io;
use std::str::FromStr;

use crate::block::{Addr, PosixThreadId, Usage};
use crate::cache::UsageSnapshot;

/// Kind of client synchronization primitive, as reported by the
/// interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Mutex,
    Rwlock,
    Cond,
    Semaphore,
    Barrier,
    Spinlock,
}

impl PrimitiveKind {
    /// Wire/report name of the primitive kind.
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveKind::Mutex => "mutex",
            PrimitiveKind::Rwlock => "rwlock",
            PrimitiveKind::Cond => "cond",
            PrimitiveKind::Semaphore => "sem",
            PrimitiveKind::Barrier => "barrier",
            PrimitiveKind::Spinlock => "spin",
        }
    }
}

impl FromStr for PrimitiveKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mutex" => Ok(PrimitiveKind::Mutex),
            "rwlock" => Ok(PrimitiveKind::Rwlock),
            "cond" => Ok(PrimitiveKind::Cond),
            "sem" => Ok(PrimitiveKind::Semaphore),
            "barrier" => Ok(PrimitiveKind::Barrier),
            "spin" => Ok(PrimitiveKind::Spinlock),
            _ => Err(()),
        }
    }
}

/// Allocation and primitive lifetime events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifeEvent {
    /// A block came into existence at `addr`. `size` is the client's
    /// requested size, before zero-size coercion.
    Alloc { addr: Addr, size: u64 },
    /// A block left the registry. `usage` is the emitting thread's counters
    /// for it; `None` if the thread never cached the block.
    Free {
        addr: Addr,
        size: u64,
        usage: Option<Usage>,
    },
    /// A synchronization primitive was initialized.
    NewSync { kind: PrimitiveKind, addr: Addr },
    /// A synchronization primitive was destroyed.
    DelSync { kind: PrimitiveKind, addr: Addr },
}

impl LifeEvent {
    /// Wire/report name of the life event variant.
    pub fn kind_str(&self) -> &'static str {
        match self {
            LifeEvent::Alloc { .. } => "alloc",
            LifeEvent::Free { .. } => "free",
            LifeEvent::NewSync { .. } => "newsync",
            LifeEvent::DelSync { .. } => "delsync",
        }
    }
}

/// Synchronization boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// The emitting thread created `child`.
    Fork { child: PosixThreadId },
    /// The emitting thread joined `child`.
    Join { child: PosixThreadId },
    /// The emitting thread exited.
    Exit,
    /// The emitting thread acquired the primitive at `addr`.
    Acquire { addr: Addr },
    /// The emitting thread released the primitive at `addr`.
    Release { addr: Addr },
}

impl SyncEvent {
    /// Wire/report name of the sync event variant.
    pub fn kind_str(&self) -> &'static str {
        match self {
            SyncEvent::Fork { .. } => "fork",
            SyncEvent::Join { .. } => "join",
            SyncEvent::Exit => "exit",
            SyncEvent::Acquire { .. } => "acq",
            SyncEvent::Release { .. } => "rel",
        }
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Free-form diagnostic visible in the trace.
    Info(&'static str),
    /// Allocation or primitive lifetime event.
    Life(LifeEvent),
    /// Synchronization boundary, carrying the emitting thread's used cache
    /// entries at that instant.
    Sync {
        event: SyncEvent,
        usage: Vec<UsageSnapshot>,
    },
}

impl EventPayload {
    /// Wire/report name of the payload family.
    pub fn kind_str(&self) -> &'static str {
        match self {
            EventPayload::Info(_) => "info",
            EventPayload::Life(_) => "life",
            EventPayload::Sync { .. } => "sync",
        }
    }
}

/// One profiler event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// POSIX identity of the emitting thread.
    pub posix_id: PosixThreadId,
    /// Instructions executed since this thread's last event.
    pub instructions: u64,
    /// Monotonically increasing id, assigned at emission.
    pub id: u64,
    /// What happened.
    pub payload: EventPayload,
}

/// Consumes events one at a time, in emission order.
///
/// Two streaming implementations exist — a line-oriented text form and a
/// structured JSON document — plus an in-memory collector. The concrete sink
/// is chosen once at startup.
pub trait EventSink {
    /// Handles one event.
    fn consume(&mut self, event: &Event) -> io::Result<()>;

    /// Flushes and closes out the stream. Called exactly once, at shutdown.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}
