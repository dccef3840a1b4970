//! The attribution engine.
//!
//! Ties the block registry, per-thread caches, event recording, and the
//! thread/sync tracking rules together behind the notification surface the
//! instrumentation and interception layers drive.
//!
//! ## Consistency model
//!
//! Execution is serialized by the host: only one thread is ever scheduled,
//! so no mutation here races another and nothing takes a lock. Logical
//! concurrency is still real — the registry is shared by all threads, and a
//! cache entry can go stale because of another thread's free or resize.
//! Consistency rests entirely on the block state tags and shared-handle
//! counts: removals tag the block instead of revoking cache entries, and
//! each cache discards stale entries the next time it trips over them.

use std::io;

use crate::block::{
    release, Addr, Block, BlockState, PosixThreadId, ThreadHandle, Usage,
    INVALID_POSIX_THREAD_ID,
};
use crate::cache::UsageSnapshot;
use crate::config::ProfilerConfig;
use crate::diag::{DiagLevel, DiagLog, DiagRecord};
use crate::event::{Event, EventPayload, EventSink, LifeEvent, PrimitiveKind, SyncEvent};
use crate::heap::ClientHeap;
use crate::registry::BlockRegistry;
use crate::thread::ThreadTable;

/// Diagnostic text for residual usage on a stale cache entry: the block was
/// freed by another thread after this thread's last synchronization
/// boundary, so the usage was never reported where it should have been.
const USED_DEAD_BLOCK: &str = "used dead block";

/// The block lifetime and attribution engine.
pub struct Profiler {
    config: ProfilerConfig,
    heap: Box<dyn ClientHeap>,
    sink: Box<dyn EventSink>,
    registry: BlockRegistry,
    threads: ThreadTable,
    diag: DiagLog,
    /// Instructions accumulated by generated code since the last event.
    global_instructions: u64,
    /// Thread currently scheduled by the host, if any.
    running: Option<ThreadHandle>,
    next_event_id: u64,
}

impl Profiler {
    /// Creates an engine over the given client heap and event sink.
    pub fn new(config: ProfilerConfig, heap: Box<dyn ClientHeap>, sink: Box<dyn EventSink>) -> Self {
        Self {
            config,
            heap,
            sink,
            registry: BlockRegistry::new(),
            threads: ThreadTable::new(),
            diag: DiagLog::new(),
            global_instructions: 0,
            running: None,
            next_event_id: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Event recording
    // -----------------------------------------------------------------------

    /// Stamps and emits an event on behalf of `thread`.
    ///
    /// Unknown threads and, unless `force`, untrackable threads drop the
    /// event silently; their instruction counters keep accumulating so the
    /// next emitted event carries the full delta. Returns whether the event
    /// reached the sink.
    fn record(&mut self, thread: ThreadHandle, payload: EventPayload, force: bool) -> bool {
        let Some(ti) = self.threads.get_mut(thread) else {
            return false;
        };
        if !force && !ti.trackable() {
            // Possibly inside the interception layer's own setup window.
            return false;
        }
        let posix_id = ti.posix_id();
        assert!(
            posix_id != INVALID_POSIX_THREAD_ID,
            "event from thread {thread} with no posix identity"
        );
        let instructions = self.global_instructions + ti.take_pending_instructions();
        self.global_instructions = 0;
        self.next_event_id += 1;
        let event = Event {
            posix_id,
            instructions,
            id: self.next_event_id,
            payload,
        };
        if let Err(err) = self.sink.consume(&event) {
            self.diag
                .record(DiagLevel::Warn, "sink_write_failed", None, err.to_string());
        }
        true
    }

    // -----------------------------------------------------------------------
    // Cache resolution
    // -----------------------------------------------------------------------

    /// Maps `addr` to the owning block in `thread`'s cache, fetching from
    /// the registry and pruning stale overlapping entries as needed.
    ///
    /// Returns the cache key (the block's start address), or `None` when no
    /// registered block contains `addr` — static data, a stack address, or a
    /// use after free; callers treat that as a no-op.
    fn resolve(&mut self, thread: ThreadHandle, addr: Addr) -> Option<Addr> {
        let mut fishy = 0u32;

        let ti = self.threads.expect_mut(thread);
        let cached = match ti.cache().find(addr) {
            Some((key, BlockState::Alive)) => Some(key),
            Some((key, _)) => {
                // Invalidated since this thread cached it; discard and fall
                // through to the registry.
                let (block, usage) = ti
                    .cache_mut()
                    .remove(key)
                    .expect("entry vanished during resolve");
                if usage.is_used() {
                    fishy += 1;
                }
                release(block);
                None
            }
            None => None,
        };

        let key = match cached {
            Some(key) => Some(key),
            None => match self.registry.find(addr).cloned() {
                None => None,
                Some(block) => {
                    // Make sure no stale entry collides with the fetched
                    // block's range before caching it.
                    let ti = self.threads.expect_mut(thread);
                    while let Some(stale) = ti.cache().find_overlap(block.addr(), block.size()) {
                        let (dead, usage) = ti
                            .cache_mut()
                            .remove(stale)
                            .expect("entry vanished during overlap pruning");
                        assert!(
                            !dead.is_alive(),
                            "live cache entry {:#x} overlaps registry block {:#x}",
                            dead.addr(),
                            block.addr()
                        );
                        if usage.is_used() {
                            fishy += 1;
                        }
                        release(dead);
                    }
                    let key = block.addr();
                    ti.cache_mut().insert(block);
                    Some(key)
                }
            },
        };

        for _ in 0..fishy {
            self.diag.record(
                DiagLevel::Info,
                "used_dead_block",
                Some(addr),
                "stale cache entry discarded with unreported usage",
            );
            self.record(thread, EventPayload::Info(USED_DEAD_BLOCK), false);
        }
        key
    }

    /// Usage counters `thread` currently holds for the block at `key`.
    fn cached_usage(&self, thread: ThreadHandle, key: Addr) -> Usage {
        self.threads.expect(thread).cache().usage(key)
    }

    /// Used-entry snapshot of `thread`'s cache for a sync event payload.
    fn snapshot(&self, thread: ThreadHandle) -> Vec<UsageSnapshot> {
        self.threads.expect(thread).cache().snapshot_used()
    }

    /// Starts a new epoch for `thread` after its snapshot was reported.
    fn reset_epoch(&mut self, thread: ThreadHandle) {
        self.threads.expect_mut(thread).cache_mut().reset_usage();
    }

    // -----------------------------------------------------------------------
    // Allocation lifecycle
    // -----------------------------------------------------------------------

    fn alloc_block(
        &mut self,
        thread: ThreadHandle,
        req_size: u64,
        align: u64,
        _zeroed: bool,
    ) -> Option<Addr> {
        if req_size > i64::MAX as u64 {
            // A negative size in the client's calling convention.
            return None;
        }
        // The interval index cannot hold empty ranges.
        let book_size = req_size.max(1);
        let addr = self.heap.alloc(align, book_size)?;
        self.record(
            thread,
            EventPayload::Life(LifeEvent::Alloc {
                addr,
                size: req_size,
            }),
            false,
        );
        if let Err(block) = self.registry.insert(Block::new(addr, book_size)) {
            self.diag.record(
                DiagLevel::Warn,
                "overlapping_alloc",
                Some(addr),
                format!("client heap returned a region overlapping a live block: {addr:#x}"),
            );
            block.set_state(BlockState::Freed);
            release(block);
        }
        Some(addr)
    }

    fn free_block(&mut self, thread: ThreadHandle, addr: Addr) {
        self.heap.free(addr);
        let Some(block) = self.registry.remove(addr) else {
            self.diag.record(
                DiagLevel::Warn,
                "bogus_free",
                Some(addr),
                format!("free of unregistered address {addr:#x}"),
            );
            return;
        };

        // The freeing thread reports its own residual usage here; other
        // threads are assumed to have reported theirs at their last sync
        // boundary.
        let key = self.resolve(thread, addr);
        let usage = key.map(|k| self.cached_usage(thread, k));
        let emitted = self.record(
            thread,
            EventPayload::Life(LifeEvent::Free {
                addr: block.addr(),
                size: block.size(),
                usage,
            }),
            false,
        );
        if emitted {
            if let Some(k) = key {
                self.threads
                    .expect_mut(thread)
                    .cache_mut()
                    .usage_mut(k)
                    .reset();
            }
        }

        block.set_state(BlockState::Freed);
        release(block);
    }

    fn resize_block(
        &mut self,
        thread: ThreadHandle,
        old_addr: Addr,
        new_size: u64,
    ) -> Option<Addr> {
        assert!(new_size > 0, "zero-size resize is resolved by the caller");

        let Some(block) = self.registry.find(old_addr).cloned() else {
            self.diag.record(
                DiagLevel::Warn,
                "bogus_realloc",
                Some(old_addr),
                format!("resize of unregistered address {old_addr:#x}"),
            );
            return None;
        };
        if block.addr() != old_addr {
            self.diag.record(
                DiagLevel::Warn,
                "bogus_realloc",
                Some(old_addr),
                format!(
                    "resize address {:#x} is not the start of its block {:#x}",
                    old_addr,
                    block.addr()
                ),
            );
            release(block);
            return None;
        }

        let old_size = block.size();
        let key = self.resolve(thread, old_addr);
        let usage = key.map(|k| self.cached_usage(thread, k));
        let emitted = self.record(
            thread,
            EventPayload::Life(LifeEvent::Free {
                addr: old_addr,
                size: old_size,
                usage,
            }),
            false,
        );
        if emitted {
            if let Some(k) = key {
                self.threads
                    .expect_mut(thread)
                    .cache_mut()
                    .usage_mut(k)
                    .reset();
            }
        }

        let new_addr = if new_size <= old_size {
            // Shrink in place: same address, same identity, every cache
            // holder observes the new size through the shared handle.
            block.shrink(new_size);
            old_addr
        } else {
            // Grow by relocating. The old identity is retired so stale
            // cache holders cannot mistake it for the new region.
            let Some(dst) = self.heap.alloc(self.config.alignment, new_size) else {
                // A failed growth leaves the old block wholly untouched.
                release(block);
                return None;
            };
            self.heap.copy(dst, old_addr, old_size);
            self.heap.free(old_addr);

            let old = self
                .registry
                .remove(old_addr)
                .expect("resized block vanished from the registry");
            old.set_state(BlockState::Reallocated);
            release(old);

            if let Err(replacement) = self.registry.insert(Block::new(dst, new_size)) {
                self.diag.record(
                    DiagLevel::Warn,
                    "overlapping_alloc",
                    Some(dst),
                    format!("client heap returned a region overlapping a live block: {dst:#x}"),
                );
                replacement.set_state(BlockState::Freed);
                release(replacement);
            }
            dst
        };

        self.record(
            thread,
            EventPayload::Life(LifeEvent::Alloc {
                addr: new_addr,
                size: new_size,
            }),
            false,
        );
        release(block);
        Some(new_addr)
    }

    // -----------------------------------------------------------------------
    // Client allocation entry points
    // -----------------------------------------------------------------------

    /// `malloc(size)`.
    pub fn client_malloc(&mut self, thread: ThreadHandle, size: u64) -> Option<Addr> {
        self.alloc_block(thread, size, self.config.alignment, false)
    }

    /// `memalign(align, size)`.
    pub fn client_memalign(&mut self, thread: ThreadHandle, align: u64, size: u64) -> Option<Addr> {
        self.alloc_block(thread, size, align, false)
    }

    /// `calloc(count, elem_size)`: zero-filled, overflow-checked.
    pub fn client_calloc(&mut self, thread: ThreadHandle, count: u64, elem_size: u64) -> Option<Addr> {
        let Some(total) = count.checked_mul(elem_size) else {
            self.diag.record(
                DiagLevel::Warn,
                "calloc_overflow",
                None,
                format!("count={count} elem_size={elem_size}"),
            );
            return None;
        };
        self.alloc_block(thread, total, self.config.alignment, true)
    }

    /// `free(addr)`.
    pub fn client_free(&mut self, thread: ThreadHandle, addr: Addr) {
        self.free_block(thread, addr);
    }

    /// `realloc(addr, size)`, applying the null-pointer and zero-size
    /// conventions before the resize path is entered.
    pub fn client_realloc(&mut self, thread: ThreadHandle, addr: Addr, size: u64) -> Option<Addr> {
        if addr == 0 {
            return self.client_malloc(thread, size);
        }
        if size == 0 {
            if self.config.realloc_zero_frees {
                self.client_free(thread, addr);
                return None;
            }
            return self.resize_block(thread, addr, 1);
        }
        self.resize_block(thread, addr, size)
    }

    /// `malloc_usable_size(addr)`: the bookkeeping size of the containing
    /// block, or 0 for an unknown address.
    pub fn client_usable_size(&mut self, thread: ThreadHandle, addr: Addr) -> u64 {
        match self.resolve(thread, addr) {
            Some(key) => self
                .threads
                .expect(thread)
                .cache()
                .block(key)
                .map(|b| b.size())
                .unwrap_or(0),
            None => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Access notifications
    // -----------------------------------------------------------------------

    /// The client read `size` bytes at `addr`.
    pub fn on_read(&mut self, thread: ThreadHandle, addr: Addr, size: u64) {
        if let Some(key) = self.resolve(thread, addr) {
            self.threads
                .expect_mut(thread)
                .cache_mut()
                .usage_mut(key)
                .bytes_read += size;
        }
    }

    /// The client wrote `size` bytes at `addr`.
    pub fn on_write(&mut self, thread: ThreadHandle, addr: Addr, size: u64) {
        if let Some(key) = self.resolve(thread, addr) {
            self.threads
                .expect_mut(thread)
                .cache_mut()
                .usage_mut(key)
                .bytes_written += size;
        }
    }

    /// Generated code retired `count` instructions.
    pub fn on_instructions(&mut self, count: u64) {
        self.global_instructions += count;
    }

    /// The host scheduled `thread`.
    pub fn on_thread_running(&mut self, thread: ThreadHandle) {
        assert!(
            self.running.is_none(),
            "thread {thread} scheduled while another is running"
        );
        self.running = Some(thread);
    }

    /// The host descheduled `thread`. The global instruction counter drains
    /// into the thread's pending count; a thread that already exited takes
    /// its unattributed tail of instructions with it.
    pub fn on_thread_stopped(&mut self, thread: ThreadHandle) {
        self.running = None;
        let count = std::mem::take(&mut self.global_instructions);
        if let Some(ti) = self.threads.get_mut(thread) {
            ti.add_pending_instructions(count);
        }
    }

    // -----------------------------------------------------------------------
    // Thread and synchronization tracking
    // -----------------------------------------------------------------------

    /// A thread came into existence. `parent == None` registers the root
    /// thread, which is trackable immediately and emits no fork event; any
    /// other registration is a fork boundary on the parent.
    pub fn on_thread_create(
        &mut self,
        parent: Option<ThreadHandle>,
        child: ThreadHandle,
        child_posix_id: PosixThreadId,
    ) {
        self.threads.register(parent, child, child_posix_id);
        let Some(parent) = parent else {
            self.threads.expect_mut(child).set_trackable(true);
            return;
        };

        // Fork boundary: trim the parent's cache, then report its epoch.
        self.threads.expect_mut(parent).cache_mut().prune(true);
        let usage = self.snapshot(parent);
        let emitted = self.record(
            parent,
            EventPayload::Sync {
                event: SyncEvent::Fork {
                    child: child_posix_id,
                },
                usage,
            },
            true,
        );
        if emitted {
            self.reset_epoch(parent);
        }
    }

    /// `thread` joined the thread with posix identity `child_posix_id`.
    pub fn on_thread_join(&mut self, thread: ThreadHandle, child_posix_id: PosixThreadId) {
        let usage = self.snapshot(thread);
        let emitted = self.record(
            thread,
            EventPayload::Sync {
                event: SyncEvent::Join {
                    child: child_posix_id,
                },
                usage,
            },
            true,
        );
        if emitted {
            self.reset_epoch(thread);
        }
    }

    /// `thread` exited. Forced: the exit must be observable even while
    /// tracking is paused. The root thread's record survives until
    /// [`shutdown`](Self::shutdown) because the client still runs teardown
    /// code afterwards; it merely stops being trackable.
    pub fn on_thread_exit(&mut self, thread: ThreadHandle) {
        let usage = self.snapshot(thread);
        self.record(
            thread,
            EventPayload::Sync {
                event: SyncEvent::Exit,
                usage,
            },
            true,
        );

        if self.threads.is_root(thread) {
            let ti = self.threads.expect_mut(thread);
            ti.set_trackable(false);
            ti.clear_posix_id();
        } else {
            let mut ti = self.threads.unregister(thread);
            ti.cache_mut().release_all();
        }
    }

    /// `thread` finished its startup bookkeeping; start emitting events.
    pub fn on_start_tracking(&mut self, thread: ThreadHandle) {
        let ti = self.threads.expect_mut(thread);
        assert!(!ti.trackable(), "thread {thread} is already tracked");
        ti.set_trackable(true);
    }

    /// Pause event emission for `thread` without losing cache state.
    pub fn on_pause_tracking(&mut self, thread: ThreadHandle) {
        let ti = self.threads.expect_mut(thread);
        assert!(ti.trackable(), "thread {thread} is not being tracked");
        ti.set_trackable(false);
    }

    /// Evicts `thread`'s dead cache entries, and unused ones with
    /// `drop_unused`. The fork boundary does this automatically; embedders
    /// can call it directly to bound cache growth over long epochs.
    pub fn prune_cache(&mut self, thread: ThreadHandle, drop_unused: bool) {
        self.threads.expect_mut(thread).cache_mut().prune(drop_unused);
    }

    /// A synchronization primitive was initialized.
    pub fn on_primitive_init(&mut self, thread: ThreadHandle, kind: PrimitiveKind, addr: Addr) {
        self.record(
            thread,
            EventPayload::Life(LifeEvent::NewSync { kind, addr }),
            false,
        );
    }

    /// A synchronization primitive was destroyed.
    pub fn on_primitive_destroy(&mut self, thread: ThreadHandle, kind: PrimitiveKind, addr: Addr) {
        self.record(
            thread,
            EventPayload::Life(LifeEvent::DelSync { kind, addr }),
            false,
        );
    }

    /// `thread` acquired the primitive at `addr`: report and reset its
    /// epoch.
    pub fn on_acquire(&mut self, thread: ThreadHandle, addr: Addr) {
        let usage = self.snapshot(thread);
        let emitted = self.record(
            thread,
            EventPayload::Sync {
                event: SyncEvent::Acquire { addr },
                usage,
            },
            false,
        );
        if emitted {
            self.reset_epoch(thread);
        }
    }

    /// `thread` is about to release the primitive at `addr`: report and
    /// reset its epoch.
    pub fn on_release(&mut self, thread: ThreadHandle, addr: Addr) {
        let usage = self.snapshot(thread);
        let emitted = self.record(
            thread,
            EventPayload::Sync {
                event: SyncEvent::Release { addr },
                usage,
            },
            false,
        );
        if emitted {
            self.reset_epoch(thread);
        }
    }

    // -----------------------------------------------------------------------
    // Teardown and introspection
    // -----------------------------------------------------------------------

    /// Tears the engine down at process end.
    ///
    /// Releases the root thread's cache, checks the registry for leaked
    /// cache references (fatal), and closes out the sink.
    pub fn shutdown(mut self) -> io::Result<()> {
        if let Some(mut root) = self.threads.take_root() {
            root.cache_mut().release_all();
        }
        std::mem::take(&mut self.registry).destroy();
        self.sink.finish()
    }

    /// Diagnostics recorded so far.
    pub fn diagnostics(&self) -> &[DiagRecord] {
        self.diag.records()
    }

    /// Removes and returns all diagnostics.
    pub fn drain_diagnostics(&mut self) -> Vec<DiagRecord> {
        self.diag.drain()
    }

    /// Number of warning-level diagnostics.
    pub fn diagnostic_warnings(&self) -> usize {
        self.diag.warning_count()
    }

    /// The global block registry.
    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// The thread table.
    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }
}
