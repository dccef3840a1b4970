//! Structured-document sink.
//!
//! Emits one JSON array of event objects. The document streams: events are
//! appended as they arrive and the array is closed by `finish()`. The sink
//! counts emitted elements so a separator precedes every element except the
//! first. Addresses serialize as plain integers.

use std::io::{self, Write};

use serde_json::{json, Map, Value};

use crate::block::Usage;
use crate::cache::UsageSnapshot;
use crate::event::{Event, EventPayload, EventSink, LifeEvent, SyncEvent};

/// Writes the JSON rendering of the event stream to `W`.
#[derive(Debug)]
pub struct JsonSink<W: Write> {
    out: W,
    items: u64,
}

impl<W: Write> JsonSink<W> {
    /// Creates a sink and opens the top-level array.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(b"[")?;
        Ok(Self { out, items: 0 })
    }
}

fn usage_fields(usage: Usage) -> Value {
    json!({ "r": usage.bytes_read, "w": usage.bytes_written })
}

fn snapshot_value(snap: &UsageSnapshot) -> Value {
    json!({
        "addr": snap.addr,
        "size": snap.size,
        "r": snap.usage.bytes_read,
        "w": snap.usage.bytes_written,
    })
}

fn life_value(life: &LifeEvent) -> Value {
    let body = match life {
        LifeEvent::Alloc { addr, size } => json!({ "addr": addr, "size": size }),
        LifeEvent::Free { addr, size, usage } => {
            let usage = usage.unwrap_or_default();
            json!({
                "addr": addr,
                "size": size,
                "r": usage.bytes_read,
                "w": usage.bytes_written,
            })
        }
        LifeEvent::NewSync { kind, addr } | LifeEvent::DelSync { kind, addr } => {
            json!({ "prim": kind.as_str(), "addr": addr })
        }
    };
    json!({ (life.kind_str()): body })
}

fn sync_value(sync: &SyncEvent, usage: &[UsageSnapshot]) -> Value {
    let subject = match sync {
        SyncEvent::Fork { child } | SyncEvent::Join { child } => json!(child),
        SyncEvent::Exit => Value::Null,
        SyncEvent::Acquire { addr } | SyncEvent::Release { addr } => json!(addr),
    };
    let dump: Vec<Value> = usage.iter().map(snapshot_value).collect();
    json!({ (sync.kind_str()): subject, "usage": dump })
}

fn event_value(event: &Event) -> Value {
    let mut obj = Map::new();
    obj.insert("thid".into(), json!(event.posix_id));
    obj.insert("icnt".into(), json!(event.instructions));
    obj.insert("id".into(), json!(event.id));
    let body = match &event.payload {
        EventPayload::Info(text) => json!(text),
        EventPayload::Life(life) => life_value(life),
        EventPayload::Sync { event: sync, usage } => sync_value(sync, usage),
    };
    obj.insert(event.payload.kind_str().into(), body);
    Value::Object(obj)
}

impl<W: Write> EventSink for JsonSink<W> {
    fn consume(&mut self, event: &Event) -> io::Result<()> {
        if self.items > 0 {
            self.out.write_all(b",\n\t")?;
        } else {
            self.out.write_all(b"\n\t")?;
        }
        self.items += 1;
        let rendered = event_value(event).to_string();
        self.out.write_all(rendered.as_bytes())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.write_all(b"\n]\n")?;
        self.out.flush()
    }
}
