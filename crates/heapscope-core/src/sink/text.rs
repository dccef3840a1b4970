//! Line-oriented human-readable sink.
//!
//! One line per event: posix id, payload family, instruction delta, then the
//! payload. Free events and synchronization events append indented usage
//! dump lines, one per reported block, with a trailing state marker for
//! blocks that are no longer alive.

use std::io::{self, Write};

use crate::block::Usage;
use crate::cache::UsageSnapshot;
use crate::event::{Event, EventPayload, EventSink, LifeEvent, SyncEvent};

/// Writes the text rendering of each event to `W`.
#[derive(Debug)]
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    /// Creates a sink writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write_usage_line(&mut self, snap: &UsageSnapshot) -> io::Result<()> {
        writeln!(
            self.out,
            "         | {:#x} {:8}, r={:8}, w={:8}{}",
            snap.addr,
            snap.size,
            snap.usage.bytes_read,
            snap.usage.bytes_written,
            snap.state.marker()
        )
    }

    fn write_life(&mut self, life: &LifeEvent) -> io::Result<()> {
        match life {
            LifeEvent::Alloc { addr, size } => {
                writeln!(self.out, "alloc: {addr:#x} {size:8}")
            }
            LifeEvent::Free { addr, size, usage } => {
                writeln!(self.out, "free: {addr:#x}")?;
                let usage = usage.unwrap_or(Usage::default());
                writeln!(
                    self.out,
                    "         | {:#x}, {:8}, r={:8}, w={:8}",
                    addr, size, usage.bytes_read, usage.bytes_written
                )
            }
            LifeEvent::NewSync { kind, addr } | LifeEvent::DelSync { kind, addr } => {
                writeln!(self.out, "{}: {:>6} {:#x}", life.kind_str(), kind.as_str(), addr)
            }
        }
    }

    fn write_sync(&mut self, sync: &SyncEvent, usage: &[UsageSnapshot]) -> io::Result<()> {
        match sync {
            SyncEvent::Fork { child } | SyncEvent::Join { child } => {
                writeln!(self.out, "{}: -> {:8}, usage:", sync.kind_str(), child)?
            }
            SyncEvent::Exit => writeln!(self.out, "exit:")?,
            SyncEvent::Acquire { addr } | SyncEvent::Release { addr } => {
                writeln!(self.out, "{}: {:#x}", sync.kind_str(), addr)?
            }
        }
        for snap in usage {
            self.write_usage_line(snap)?;
        }
        Ok(())
    }
}

impl<W: Write> EventSink for TextSink<W> {
    fn consume(&mut self, event: &Event) -> io::Result<()> {
        write!(
            self.out,
            "{:8} {:>4} icnt={:8} ",
            event.posix_id,
            event.payload.kind_str(),
            event.instructions
        )?;
        match &event.payload {
            EventPayload::Info(text) => writeln!(self.out, "{text}"),
            EventPayload::Life(life) => self.write_life(life),
            EventPayload::Sync { event: sync, usage } => self.write_sync(sync, usage),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
