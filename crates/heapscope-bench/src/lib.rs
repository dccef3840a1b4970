//! Benchmark support for the heapscope engine. The measurements live in
//! `benches/`; this crate only hosts shared setup helpers.

#![forbid(unsafe_code)]

use std::io;

use heapscope_core::{Addr, Event, EventSink, Profiler, ProfilerConfig, SlabHeap, ThreadHandle};

/// Root thread handle used by every benchmark.
pub const ROOT: ThreadHandle = 1;

/// Sink that discards every event, keeping measurements on the engine path.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn consume(&mut self, _event: &Event) -> io::Result<()> {
        Ok(())
    }
}

/// Engine with a registered root thread and `blocks` live allocations of
/// `size` bytes each. Returns the engine and the allocation addresses.
pub fn engine_with_blocks(blocks: usize, size: u64) -> (Profiler, Vec<Addr>) {
    let mut prof = Profiler::new(
        ProfilerConfig::default(),
        Box::new(SlabHeap::new()),
        Box::new(NullSink),
    );
    prof.on_thread_create(None, ROOT, 1);
    let addrs = (0..blocks)
        .map(|_| {
            prof.client_malloc(ROOT, size)
                .expect("benchmark allocation failed")
        })
        .collect();
    (prof, addrs)
}
