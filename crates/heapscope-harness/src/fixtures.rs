//! Fixture loading and management.
//!
//! A fixture is a JSON trace of the notifications an instrumented run would
//! deliver to the engine. Allocation ops bind their result to a string
//! label; later ops address memory either absolutely or as
//! `{ "base": <label>, "offset": <n> }`, so fixtures stay valid whatever
//! addresses the client heap hands out.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use heapscope_core::{PosixThreadId, ThreadHandle};

/// One replayable notification trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFixture {
    /// Trace identifier.
    pub name: String,
    /// What the trace exercises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether `realloc(p, 0)` frees (glibc behavior) during this replay.
    #[serde(default = "default_realloc_zero_frees")]
    pub realloc_zero_frees: bool,
    /// Notifications, in host scheduling order.
    pub ops: Vec<TraceOp>,
}

fn default_realloc_zero_frees() -> bool {
    true
}

/// Address operand: absolute, or an offset from a labeled allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddrExpr {
    /// A literal address.
    Absolute(u64),
    /// `base` names an earlier allocation's label.
    Label {
        base: String,
        #[serde(default)]
        offset: u64,
    },
}

/// One notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TraceOp {
    ThreadCreate {
        /// Absent for the root thread.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ThreadHandle>,
        thread: ThreadHandle,
        posix_id: PosixThreadId,
    },
    StartTracking {
        thread: ThreadHandle,
    },
    PauseTracking {
        thread: ThreadHandle,
    },
    ThreadExit {
        thread: ThreadHandle,
    },
    ThreadJoin {
        thread: ThreadHandle,
        child_posix_id: PosixThreadId,
    },
    Malloc {
        thread: ThreadHandle,
        size: u64,
        dst: String,
    },
    Calloc {
        thread: ThreadHandle,
        count: u64,
        elem_size: u64,
        dst: String,
    },
    Memalign {
        thread: ThreadHandle,
        align: u64,
        size: u64,
        dst: String,
    },
    Realloc {
        thread: ThreadHandle,
        ptr: AddrExpr,
        size: u64,
        dst: String,
    },
    Free {
        thread: ThreadHandle,
        ptr: AddrExpr,
    },
    Read {
        thread: ThreadHandle,
        at: AddrExpr,
        size: u64,
    },
    Write {
        thread: ThreadHandle,
        at: AddrExpr,
        size: u64,
    },
    PrimInit {
        thread: ThreadHandle,
        prim: String,
        addr: AddrExpr,
    },
    PrimDestroy {
        thread: ThreadHandle,
        prim: String,
        addr: AddrExpr,
    },
    Acquire {
        thread: ThreadHandle,
        addr: AddrExpr,
    },
    Release {
        thread: ThreadHandle,
        addr: AddrExpr,
    },
    Instructions {
        count: u64,
    },
    Running {
        thread: ThreadHandle,
    },
    Stopped {
        thread: ThreadHandle,
    },
}

impl TraceFixture {
    /// Parses a fixture from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the fixture to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// SHA-256 digest of a fixture file, for run-report integrity.
pub fn fixture_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_ops_parse() {
        let json = r#"{
            "name": "smoke",
            "ops": [
                { "op": "thread_create", "thread": 1, "posix_id": 1 },
                { "op": "malloc", "thread": 1, "size": 10, "dst": "a" },
                { "op": "write", "thread": 1, "at": { "base": "a", "offset": 2 }, "size": 4 },
                { "op": "free", "thread": 1, "ptr": { "base": "a" } }
            ]
        }"#;
        let fixture = TraceFixture::from_json(json).unwrap();
        assert_eq!(fixture.name, "smoke");
        assert!(fixture.realloc_zero_frees);
        assert_eq!(fixture.ops.len(), 4);
        assert!(matches!(
            &fixture.ops[0],
            TraceOp::ThreadCreate {
                parent: None,
                thread: 1,
                posix_id: 1,
            }
        ));
        assert!(matches!(
            &fixture.ops[2],
            TraceOp::Write {
                at: AddrExpr::Label { base, offset: 2 },
                size: 4,
                ..
            } if base == "a"
        ));
    }

    #[test]
    fn absolute_addresses_parse_as_numbers() {
        let json = r#"{
            "name": "abs",
            "realloc_zero_frees": false,
            "ops": [ { "op": "read", "thread": 1, "at": 4096, "size": 1 } ]
        }"#;
        let fixture = TraceFixture::from_json(json).unwrap();
        assert!(!fixture.realloc_zero_frees);
        assert!(matches!(
            &fixture.ops[0],
            TraceOp::Read {
                at: AddrExpr::Absolute(4096),
                ..
            }
        ));
    }

    #[test]
    fn fixtures_round_trip_through_json() {
        let fixture = TraceFixture {
            name: "rt".into(),
            description: Some("round trip".into()),
            realloc_zero_frees: false,
            ops: vec![
                TraceOp::ThreadCreate {
                    parent: None,
                    thread: 1,
                    posix_id: 1,
                },
                TraceOp::Instructions { count: 12 },
                TraceOp::Acquire {
                    thread: 1,
                    addr: AddrExpr::Absolute(64),
                },
            ],
        };
        let json = fixture.to_json().unwrap();
        let back = TraceFixture::from_json(&json).unwrap();
        assert_eq!(back.name, fixture.name);
        assert_eq!(back.ops.len(), 3);
        assert!(!back.realloc_zero_frees);
    }

    #[test]
    fn digest_is_stable_and_hex() {
        let a = fixture_digest(b"hello");
        let b = fixture_digest(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fixture_digest(b"other"), a);
    }
}
