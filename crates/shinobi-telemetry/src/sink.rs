use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One structured log record: level, message, context (target and span),
/// metadata (event fields).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub span: Option<String>,
    pub run_id: Option<String>,
}

/// Receiver of structured records. Storage mechanics are the sink's concern.
pub trait LogSink: Send + Sync {
    fn record(&self, record: LogRecord);
}

/// Bounded in-process sink; the oldest records are dropped first.
pub struct MemoryLogSink {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            let _ = records.pop_front();
        }
        records.push_back(record);
    }
}

/// tracing Layer that forwards events at or above `min_level` to a [`LogSink`].
pub struct SinkLayer {
    sink: Arc<dyn LogSink>,
    min_level: tracing::Level,
}

impl SinkLayer {
    pub fn new(sink: Arc<dyn LogSink>, min_level: tracing::Level) -> Self {
        Self { sink, min_level }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    run_id: Option<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(val),
            "run_id" => self.run_id = Some(val.trim_matches('"').to_string()),
            name => {
                let _ = self
                    .fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "run_id" => self.run_id = Some(value.to_string()),
            name => {
                let _ = self
                    .fields
                    .insert(name.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            let _ = self
                .fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit the run id.
struct SpanRunId(String);

impl<S> Layer<S> for SinkLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.run_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(SpanRunId(id)) = span.extensions().get::<SpanRunId>() {
                        visitor.run_id = Some(id.clone());
                        break;
                    }
                }
            }
        }

        let span = ctx
            .event_scope(event)
            .and_then(|mut scope| scope.next())
            .map(|span| span.name().to_string());

        self.sink.record(LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            span,
            run_id: visitor.run_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(run_id) = visitor.run_id {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanRunId(run_id));
            }
        }
    }
}
