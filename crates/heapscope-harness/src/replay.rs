//! Replays a fixture's notifications through the attribution engine.

use std::collections::HashMap;

use thiserror::Error;

use heapscope_core::{
    Addr, DiagRecord, EventSink, PrimitiveKind, Profiler, ProfilerConfig, SlabHeap,
};

use crate::fixtures::{AddrExpr, TraceFixture, TraceOp};

/// Replay failure. Engine-level invariant violations are not errors — they
/// abort, because a fixture that trips them is reporting corrupt
/// bookkeeping, not a bad input file.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("fixture does not parse: {0}")]
    Fixture(#[from] serde_json::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("op {index}: unknown label `{label}`")]
    UnknownLabel { index: usize, label: String },
    #[error("op {index}: unknown primitive kind `{kind}`")]
    UnknownPrimitive { index: usize, kind: String },
    #[error("op {index}: client allocation failed")]
    AllocationFailed { index: usize },
}

/// Outcome of one replayed fixture.
#[derive(Debug)]
pub struct RunReport {
    /// Number of notifications applied.
    pub ops_applied: usize,
    /// Diagnostics the engine recorded during the run.
    pub diagnostics: Vec<DiagRecord>,
}

impl RunReport {
    /// Number of warning-level diagnostics.
    pub fn warnings(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.level != heapscope_core::DiagLevel::Info)
            .count()
    }
}

/// Applies trace ops to an engine, binding allocation labels as it goes.
#[derive(Debug, Default)]
pub struct Replayer {
    labels: HashMap<String, Addr>,
}

impl Replayer {
    /// Creates a replayer with no bound labels.
    pub fn new() -> Self {
        Self::default()
    }

    fn addr(&self, index: usize, expr: &AddrExpr) -> Result<Addr, ReplayError> {
        match expr {
            AddrExpr::Absolute(addr) => Ok(*addr),
            AddrExpr::Label { base, offset } => self
                .labels
                .get(base)
                .map(|addr| addr + offset)
                .ok_or_else(|| ReplayError::UnknownLabel {
                    index,
                    label: base.clone(),
                }),
        }
    }

    fn prim(&self, index: usize, kind: &str) -> Result<PrimitiveKind, ReplayError> {
        kind.parse().map_err(|()| ReplayError::UnknownPrimitive {
            index,
            kind: kind.to_string(),
        })
    }

    fn bind(&mut self, index: usize, dst: &str, addr: Option<Addr>) -> Result<(), ReplayError> {
        let addr = addr.ok_or(ReplayError::AllocationFailed { index })?;
        self.labels.insert(dst.to_string(), addr);
        Ok(())
    }

    /// Applies one op.
    pub fn apply(
        &mut self,
        prof: &mut Profiler,
        index: usize,
        op: &TraceOp,
    ) -> Result<(), ReplayError> {
        match op {
            TraceOp::ThreadCreate {
                parent,
                thread,
                posix_id,
            } => prof.on_thread_create(*parent, *thread, *posix_id),
            TraceOp::StartTracking { thread } => prof.on_start_tracking(*thread),
            TraceOp::PauseTracking { thread } => prof.on_pause_tracking(*thread),
            TraceOp::ThreadExit { thread } => prof.on_thread_exit(*thread),
            TraceOp::ThreadJoin {
                thread,
                child_posix_id,
            } => prof.on_thread_join(*thread, *child_posix_id),
            TraceOp::Malloc { thread, size, dst } => {
                let addr = prof.client_malloc(*thread, *size);
                self.bind(index, dst, addr)?;
            }
            TraceOp::Calloc {
                thread,
                count,
                elem_size,
                dst,
            } => {
                let addr = prof.client_calloc(*thread, *count, *elem_size);
                self.bind(index, dst, addr)?;
            }
            TraceOp::Memalign {
                thread,
                align,
                size,
                dst,
            } => {
                let addr = prof.client_memalign(*thread, *align, *size);
                self.bind(index, dst, addr)?;
            }
            TraceOp::Realloc {
                thread,
                ptr,
                size,
                dst,
            } => {
                let old = self.addr(index, ptr)?;
                if let Some(addr) = prof.client_realloc(*thread, old, *size) {
                    self.labels.insert(dst.clone(), addr);
                }
            }
            TraceOp::Free { thread, ptr } => {
                let addr = self.addr(index, ptr)?;
                prof.client_free(*thread, addr);
            }
            TraceOp::Read { thread, at, size } => {
                let addr = self.addr(index, at)?;
                prof.on_read(*thread, addr, *size);
            }
            TraceOp::Write { thread, at, size } => {
                let addr = self.addr(index, at)?;
                prof.on_write(*thread, addr, *size);
            }
            TraceOp::PrimInit { thread, prim, addr } => {
                let kind = self.prim(index, prim)?;
                let addr = self.addr(index, addr)?;
                prof.on_primitive_init(*thread, kind, addr);
            }
            TraceOp::PrimDestroy { thread, prim, addr } => {
                let kind = self.prim(index, prim)?;
                let addr = self.addr(index, addr)?;
                prof.on_primitive_destroy(*thread, kind, addr);
            }
            TraceOp::Acquire { thread, addr } => {
                let addr = self.addr(index, addr)?;
                prof.on_acquire(*thread, addr);
            }
            TraceOp::Release { thread, addr } => {
                let addr = self.addr(index, addr)?;
                prof.on_release(*thread, addr);
            }
            TraceOp::Instructions { count } => prof.on_instructions(*count),
            TraceOp::Running { thread } => prof.on_thread_running(*thread),
            TraceOp::Stopped { thread } => prof.on_thread_stopped(*thread),
        }
        Ok(())
    }
}

/// Replays a whole fixture into a fresh engine over the given sink, tearing
/// the engine down afterwards.
pub fn run_fixture(fixture: &TraceFixture, sink: Box<dyn EventSink>) -> Result<RunReport, ReplayError> {
    let config = ProfilerConfig {
        realloc_zero_frees: fixture.realloc_zero_frees,
        ..ProfilerConfig::default()
    };
    let mut prof = Profiler::new(config, Box::new(SlabHeap::new()), sink);
    let mut replayer = Replayer::new();
    for (index, op) in fixture.ops.iter().enumerate() {
        replayer.apply(&mut prof, index, op)?;
    }
    let diagnostics = prof.drain_diagnostics();
    prof.shutdown()?;
    Ok(RunReport {
        ops_applied: fixture.ops.len(),
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_core::sink::MemorySink;
    use heapscope_core::{EventPayload, LifeEvent, Usage};

    fn fixture(json: &str) -> TraceFixture {
        TraceFixture::from_json(json).unwrap()
    }

    #[test]
    fn labels_bind_allocations_and_resolve_offsets() {
        let fx = fixture(
            r#"{
                "name": "labels",
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "malloc", "thread": 1, "size": 10, "dst": "a" },
                    { "op": "write", "thread": 1, "at": { "base": "a", "offset": 2 }, "size": 4 },
                    { "op": "free", "thread": 1, "ptr": { "base": "a" } }
                ]
            }"#,
        );
        let sink = MemorySink::new();
        let buffer = sink.buffer();
        let report = run_fixture(&fx, Box::new(sink)).unwrap();
        assert_eq!(report.ops_applied, 4);
        assert_eq!(report.warnings(), 0);

        let events = buffer.borrow();
        let free = events
            .iter()
            .find_map(|ev| match &ev.payload {
                EventPayload::Life(LifeEvent::Free { usage, .. }) => Some(*usage),
                _ => None,
            })
            .expect("free event present");
        assert_eq!(
            free,
            Some(Usage {
                bytes_read: 0,
                bytes_written: 4,
            })
        );
    }

    #[test]
    fn unknown_label_is_a_replay_error() {
        let fx = fixture(
            r#"{
                "name": "bad",
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "free", "thread": 1, "ptr": { "base": "nope" } }
                ]
            }"#,
        );
        let err = run_fixture(&fx, Box::new(MemorySink::new())).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::UnknownLabel { index: 1, ref label } if label == "nope"
        ));
    }

    #[test]
    fn unknown_primitive_kind_is_a_replay_error() {
        let fx = fixture(
            r#"{
                "name": "bad-prim",
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "prim_init", "thread": 1, "prim": "futex", "addr": 64 }
                ]
            }"#,
        );
        let err = run_fixture(&fx, Box::new(MemorySink::new())).unwrap_err();
        assert!(matches!(err, ReplayError::UnknownPrimitive { index: 1, .. }));
    }

    #[test]
    fn bogus_free_surfaces_in_the_report() {
        let fx = fixture(
            r#"{
                "name": "bogus",
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "free", "thread": 1, "ptr": 57005 }
                ]
            }"#,
        );
        let report = run_fixture(&fx, Box::new(MemorySink::new())).unwrap();
        assert_eq!(report.warnings(), 1);
        assert_eq!(report.diagnostics[0].event, "bogus_free");
    }

    #[test]
    fn realloc_zero_policy_comes_from_the_fixture() {
        let fx = fixture(
            r#"{
                "name": "rz",
                "realloc_zero_frees": false,
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "malloc", "thread": 1, "size": 8, "dst": "a" },
                    { "op": "realloc", "thread": 1, "ptr": { "base": "a" }, "size": 0, "dst": "a2" },
                    { "op": "read", "thread": 1, "at": { "base": "a2" }, "size": 1 },
                    { "op": "free", "thread": 1, "ptr": { "base": "a2" } }
                ]
            }"#,
        );
        let sink = MemorySink::new();
        let buffer = sink.buffer();
        let report = run_fixture(&fx, Box::new(sink)).unwrap();
        assert_eq!(report.warnings(), 0);

        // The block shrank to one byte instead of being freed.
        let events = buffer.borrow();
        let allocs: Vec<&LifeEvent> = events
            .iter()
            .filter_map(|ev| match &ev.payload {
                EventPayload::Life(life @ LifeEvent::Alloc { .. }) => Some(life),
                _ => None,
            })
            .collect();
        assert_eq!(allocs.len(), 2);
        assert!(matches!(allocs[1], LifeEvent::Alloc { size: 1, .. }));
    }

    #[test]
    fn multi_thread_trace_replays_in_order() {
        let fx = fixture(
            r#"{
                "name": "threads",
                "ops": [
                    { "op": "thread_create", "thread": 1, "posix_id": 1 },
                    { "op": "malloc", "thread": 1, "size": 32, "dst": "buf" },
                    { "op": "thread_create", "parent": 1, "thread": 2, "posix_id": 2 },
                    { "op": "start_tracking", "thread": 2 },
                    { "op": "instructions", "count": 40 },
                    { "op": "write", "thread": 2, "at": { "base": "buf" }, "size": 16 },
                    { "op": "acquire", "thread": 2, "addr": 4096 },
                    { "op": "thread_exit", "thread": 2 },
                    { "op": "thread_join", "thread": 1, "child_posix_id": 2 },
                    { "op": "free", "thread": 1, "ptr": { "base": "buf" } }
                ]
            }"#,
        );
        let sink = MemorySink::new();
        let buffer = sink.buffer();
        let report = run_fixture(&fx, Box::new(sink)).unwrap();
        assert_eq!(report.ops_applied, 10);

        let events = buffer.borrow();
        // alloc, fork, acquire, exit, join, free — in that order.
        let kinds: Vec<&'static str> = events.iter().map(|ev| ev.payload.kind_str()).collect();
        assert_eq!(kinds, vec!["life", "sync", "sync", "sync", "sync", "life"]);
        // The acquire carries thread 2's usage of the shared buffer and the
        // pending instruction delta.
        let acquire = &events[2];
        assert_eq!(acquire.instructions, 40);
        match &acquire.payload {
            EventPayload::Sync { usage, .. } => {
                assert_eq!(usage.len(), 1);
                assert_eq!(usage[0].usage.bytes_written, 16);
            }
            other => panic!("expected a sync payload, got {other:?}"),
        }
    }
}
