//! Event bus: stamps each emitted event with a per-run sequence number,
//! enforces permissions and cost limits ahead of masking, then fans the
//! masked payload out to every registered sink, isolating a sink's
//! failure from its siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use crate::error::{GraphError, PolicyError, Result};
use crate::policy::cost::CostLimiter;
use crate::policy::masking::MaskingEngine;
use crate::policy::permissions::PermissionManager;

/// Shared handle to a bus's `emit`, cloned into every node's
/// `ComponentContext` so components and policy engines can all raise
/// events without holding a reference to the bus itself.
pub type EmitFn = Arc<dyn Fn(&str, HashMap<String, JsonValue>) -> Result<()> + Send + Sync>;

/// An `EmitFn` that discards every event; used where only the signature is
/// needed, such as unit tests for policy engines.
pub fn null_emit_fn() -> EmitFn {
    Arc::new(|_event, _payload| Ok(()))
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event: String,
    pub payload: HashMap<String, JsonValue>,
    pub error: Option<String>,
}

pub trait EventSink: Send + Sync {
    fn export(&self, event: &str, payload: &HashMap<String, JsonValue>) -> Result<()>;
}

pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
    masking: MaskingEngine,
    permissions: PermissionManager,
    cost: CostLimiter,
    sequence: Mutex<HashMap<String, u64>>,
    fallback: Mutex<Vec<EventRecord>>,
}

impl EventBus {
    pub fn new(masking: MaskingEngine, permissions: PermissionManager, cost: CostLimiter) -> Self {
        Self {
            sinks: Vec::new(),
            masking,
            permissions,
            cost,
            sequence: Mutex::new(HashMap::new()),
            fallback: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn fallback_records(&self) -> Vec<EventRecord> {
        self.fallback.lock().expect("event bus mutex poisoned").clone()
    }

    /// Turns this bus into an `EmitFn` bound by `Arc`, for handing to
    /// schedulers and component contexts.
    pub fn into_emit_fn(self: Arc<Self>) -> EmitFn {
        let bus = self.clone();
        Arc::new(move |event, payload| bus.emit(event, payload))
    }

    pub fn emit(&self, event: &str, mut payload: HashMap<String, JsonValue>) -> Result<()> {
        let run_id = payload
            .get("run_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                GraphError::Policy(PolicyError::new("ERR_EVENT_MISSING_RUN_ID", "event payload missing run_id"))
            })?;

        let sequence = {
            let mut sequences = self.sequence.lock().expect("event bus mutex poisoned");
            let next = sequences.entry(run_id.clone()).or_insert(0);
            let current = *next;
            *next += 1;
            current
        };
        payload.entry("sequence".to_string()).or_insert_with(|| JsonValue::from(sequence));
        payload
            .entry("timestamp".to_string())
            .or_insert_with(|| JsonValue::String(chrono::Utc::now().to_rfc3339()));

        match event {
            "tool.call" => {
                let required: Vec<String> = payload
                    .get("required_permissions")
                    .and_then(JsonValue::as_array)
                    .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let component_id = payload
                    .get("component_id")
                    .or_else(|| payload.get("node_id"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or("");
                self.permissions.check(component_id, &required)?;
            }
            "llm.call" => {
                let tokens_in = payload.get("tokens_in").and_then(JsonValue::as_u64).unwrap_or(0);
                let tokens_out = payload.get("tokens_out").and_then(JsonValue::as_u64).unwrap_or(0);
                self.cost.record_llm_call(&run_id, tokens_in, tokens_out)?;
            }
            _ => {}
        }

        let masked = self.masking.mask(&run_id, &payload);

        for sink in &self.sinks {
            if let Err(err) = sink.export(event, &masked) {
                self.fallback.lock().expect("event bus mutex poisoned").push(EventRecord {
                    event: event.to_string(),
                    payload: masked.clone(),
                    error: Some(err.to_string()),
                });
            }
        }

        Ok(())
    }
}

/// Reference sink: appends one JSON object per line to any writer.
pub struct JsonlEventSink<W> {
    writer: Mutex<W>,
}

impl<W: std::io::Write + Send> JsonlEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

impl<W: std::io::Write + Send> EventSink for JsonlEventSink<W> {
    fn export(&self, event: &str, payload: &HashMap<String, JsonValue>) -> Result<()> {
        let mut record = serde_json::Map::new();
        record.insert("event".to_string(), JsonValue::String(event.to_string()));
        for (key, value) in payload {
            record.insert(key.clone(), value.clone());
        }
        let line = serde_json::to_string(&JsonValue::Object(record)).map_err(|err| {
            GraphError::Policy(PolicyError::new("ERR_EVENT_SINK_ENCODE", err.to_string()))
        })?;
        let mut writer = self.writer.lock().expect("jsonl sink mutex poisoned");
        writeln!(writer, "{line}")
            .map_err(|err| GraphError::Policy(PolicyError::new("ERR_EVENT_SINK_IO", err.to_string())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::cost::CostConfig;
    use crate::policy::masking::MaskingConfig;
    use crate::policy::permissions::PermissionConfig;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn bus() -> EventBus {
        EventBus::new(
            MaskingEngine::new(MaskingConfig::default()),
            PermissionManager::new(PermissionConfig::default()),
            CostLimiter::new(CostConfig::default()),
        )
    }

    fn payload(pairs: &[(&str, JsonValue)]) -> HashMap<String, JsonValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn assigns_increasing_sequence_per_run() {
        let bus = bus();
        bus.emit("node.start", payload(&[("run_id", json!("r1"))])).unwrap();
        bus.emit("node.end", payload(&[("run_id", json!("r1"))])).unwrap();
        let records: Vec<_> = {
            struct Capture(StdMutex<Vec<HashMap<String, JsonValue>>>);
            impl EventSink for Capture {
                fn export(&self, _event: &str, payload: &HashMap<String, JsonValue>) -> Result<()> {
                    self.0.lock().unwrap().push(payload.clone());
                    Ok(())
                }
            }
            let capture = Arc::new(Capture(StdMutex::new(Vec::new())));
            let mut bus = bus;
            bus.register(capture.clone());
            bus.emit("node.start", payload(&[("run_id", json!("r2"))])).unwrap();
            bus.emit("node.start", payload(&[("run_id", json!("r2"))])).unwrap();
            capture.0.lock().unwrap().clone()
        };
        assert_eq!(records[0]["sequence"], json!(0));
        assert_eq!(records[1]["sequence"], json!(1));
    }

    #[test]
    fn missing_run_id_is_rejected() {
        let bus = bus();
        let err = bus.emit("node.start", payload(&[])).unwrap_err();
        assert_eq!(err.code(), "ERR_EVENT_MISSING_RUN_ID");
    }

    #[test]
    fn tool_call_enforces_permissions_before_sinks_see_it() {
        let bus = bus();
        let err = bus
            .emit(
                "tool.call",
                payload(&[
                    ("run_id", json!("r1")),
                    ("component_id", json!("fetcher")),
                    ("required_permissions", json!(["http"])),
                ]),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ERR_TOOL_PERMISSION_DENIED");
    }

    #[test]
    fn llm_call_enforces_cost_cap() {
        let bus = EventBus::new(
            MaskingEngine::new(MaskingConfig::default()),
            PermissionManager::new(PermissionConfig::default()),
            CostLimiter::new(CostConfig { per_run_tokens: Some(10) }),
        );
        let err = bus
            .emit("llm.call", payload(&[("run_id", json!("r1")), ("tokens_in", json!(20)), ("tokens_out", json!(0))]))
            .unwrap_err();
        assert_eq!(err.code(), "ERR_COST_LIMIT_EXCEEDED");
    }

    #[test]
    fn sink_failure_is_isolated_into_fallback_without_failing_emit() {
        struct Failing;
        impl EventSink for Failing {
            fn export(&self, _event: &str, _payload: &HashMap<String, JsonValue>) -> Result<()> {
                Err(GraphError::Policy(PolicyError::new("ERR_SINK", "boom")))
            }
        }
        let mut bus = bus();
        bus.register(Arc::new(Failing));
        bus.emit("node.start", payload(&[("run_id", json!("r1"))])).unwrap();
        let fallback = bus.fallback_records();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].event, "node.start");
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_event() {
        let buf: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        struct SharedWriter(Arc<StdMutex<Vec<u8>>>);
        impl std::io::Write for SharedWriter {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().write(data)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let sink = JsonlEventSink::new(SharedWriter(buf.clone()));
        sink.export("node.start", &payload(&[("run_id", json!("r1"))])).unwrap();
        sink.export("node.end", &payload(&[("run_id", json!("r1"))])).unwrap();
        let written = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.lines().next().unwrap().contains("\"event\":\"node.start\""));
    }
}
