//! Trace-replay harness for the heapscope attribution engine.
//!
//! This crate provides:
//! - Fixture loading: JSON traces of instrumentation/interception
//!   notifications, with symbolic addresses bound at replay time
//! - Replay: drive a fixture through the engine and collect a run report
//! - The `heapscope` CLI: replay a trace, select the output sink, print a
//!   summary with the fixture digest and diagnostic counts

#![forbid(unsafe_code)]

pub mod fixtures;
pub mod replay;

pub use fixtures::{AddrExpr, TraceFixture, TraceOp};
pub use replay::{run_fixture, ReplayError, Replayer, RunReport};
