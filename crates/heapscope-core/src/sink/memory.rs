//! In-memory event collector.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::event::{Event, EventSink};

/// Shared handle to a [`MemorySink`]'s collected events. Stays readable
/// after the sink itself has been handed to the profiler.
pub type EventBuffer = Rc<RefCell<Vec<Event>>>;

/// Accumulates events in a shared `Vec`. Used by the harness and by tests
/// that assert on the emitted stream.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: EventBuffer,
}

impl MemorySink {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the collected events, in emission order.
    pub fn buffer(&self) -> EventBuffer {
        Rc::clone(&self.events)
    }
}

impl EventSink for MemorySink {
    fn consume(&mut self, event: &Event) -> io::Result<()> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}
