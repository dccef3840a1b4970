//! Thread bookkeeping.
//!
//! A thread is admitted to tracking when its creation is announced and torn
//! down when it exits. The root thread is special: the client runs teardown
//! code after its exit notification, so its record survives until engine
//! shutdown. A thread's progression is: unknown → registered (bookkeeping
//! only) → tracking (events emitted) → exited; the middle two states are the
//! `trackable` flag, the outer two are table membership.

use std::collections::HashMap;

use crate::block::{PosixThreadId, ThreadHandle, INVALID_POSIX_THREAD_ID};
use crate::cache::ThreadCache;

/// Per-thread record: identity, private block cache, and the instruction
/// count accumulated since this thread last emitted an event.
#[derive(Debug)]
pub struct ThreadInfo {
    handle: ThreadHandle,
    parent: Option<ThreadHandle>,
    posix_id: PosixThreadId,
    cache: ThreadCache,
    pending_instructions: u64,
    trackable: bool,
}

impl ThreadInfo {
    fn new(handle: ThreadHandle, parent: Option<ThreadHandle>, posix_id: PosixThreadId) -> Self {
        Self {
            handle,
            parent,
            posix_id,
            cache: ThreadCache::new(),
            pending_instructions: 0,
            trackable: false,
        }
    }

    /// Host scheduler handle.
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// Creating thread's handle; `None` for the root thread.
    pub fn parent(&self) -> Option<ThreadHandle> {
        self.parent
    }

    /// POSIX-level identity stamped on this thread's events.
    pub fn posix_id(&self) -> PosixThreadId {
        self.posix_id
    }

    /// Drops the identity when the root thread exits but its record lives on.
    pub(crate) fn clear_posix_id(&mut self) {
        self.posix_id = INVALID_POSIX_THREAD_ID;
    }

    /// Whether events from this thread are currently emitted.
    pub fn trackable(&self) -> bool {
        self.trackable
    }

    pub(crate) fn set_trackable(&mut self, trackable: bool) {
        self.trackable = trackable;
    }

    /// This thread's private block cache.
    pub fn cache(&self) -> &ThreadCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut ThreadCache {
        &mut self.cache
    }

    /// Instruction count carried since this thread's last event.
    pub fn pending_instructions(&self) -> u64 {
        self.pending_instructions
    }

    pub(crate) fn add_pending_instructions(&mut self, count: u64) {
        self.pending_instructions += count;
    }

    pub(crate) fn take_pending_instructions(&mut self) -> u64 {
        std::mem::take(&mut self.pending_instructions)
    }
}

/// All registered threads, keyed by host handle.
#[derive(Debug, Default)]
pub struct ThreadTable {
    threads: HashMap<ThreadHandle, ThreadInfo>,
    root: Option<ThreadHandle>,
}

impl ThreadTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly created thread. Registering a handle twice, or a
    /// second root, is a bookkeeping violation.
    pub fn register(
        &mut self,
        parent: Option<ThreadHandle>,
        handle: ThreadHandle,
        posix_id: PosixThreadId,
    ) {
        assert!(
            posix_id != INVALID_POSIX_THREAD_ID,
            "thread {handle} registered without a posix id"
        );
        if parent.is_none() {
            assert!(self.root.is_none(), "root thread registered twice");
            self.root = Some(handle);
        }
        let prev = self
            .threads
            .insert(handle, ThreadInfo::new(handle, parent, posix_id));
        assert!(prev.is_none(), "thread handle {handle} registered twice");
    }

    /// Record for `handle`, if registered.
    pub fn get(&self, handle: ThreadHandle) -> Option<&ThreadInfo> {
        self.threads.get(&handle)
    }

    /// Mutable record for `handle`, if registered.
    pub fn get_mut(&mut self, handle: ThreadHandle) -> Option<&mut ThreadInfo> {
        self.threads.get_mut(&handle)
    }

    /// Record for `handle`; an unknown handle on a lifecycle or access path
    /// means the bookkeeping is corrupted, so this is fatal.
    pub fn expect(&self, handle: ThreadHandle) -> &ThreadInfo {
        self.threads
            .get(&handle)
            .unwrap_or_else(|| panic!("notification for unregistered thread {handle}"))
    }

    /// Mutable variant of [`expect`](Self::expect).
    pub fn expect_mut(&mut self, handle: ThreadHandle) -> &mut ThreadInfo {
        self.threads
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("notification for unregistered thread {handle}"))
    }

    /// Removes a non-root thread's record on exit.
    pub fn unregister(&mut self, handle: ThreadHandle) -> ThreadInfo {
        assert!(
            self.root != Some(handle),
            "root thread teardown is deferred to shutdown"
        );
        self.threads
            .remove(&handle)
            .unwrap_or_else(|| panic!("exit notification for unregistered thread {handle}"))
    }

    /// Removes the root thread's record at shutdown.
    pub fn take_root(&mut self) -> Option<ThreadInfo> {
        let root = self.root.take()?;
        self.threads.remove(&root)
    }

    /// Whether `handle` is the root thread.
    pub fn is_root(&self, handle: ThreadHandle) -> bool {
        self.root == Some(handle)
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// True if no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
