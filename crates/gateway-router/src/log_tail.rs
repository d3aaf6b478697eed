use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Fans every tracing event out to `GET /api/logs/sse` subscribers as a JSON
/// line. The dispatcher never reads from this channel.
pub struct LiveLogLayer {
    sender: broadcast::Sender<String>,
}

impl LiveLogLayer {
    pub fn new(capacity: usize) -> (Self, broadcast::Sender<String>) {
        let (sender, _) = broadcast::channel(capacity);
        (Self { sender: sender.clone() }, sender)
    }
}

impl<S> Layer<S> for LiveLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let line = serde_json::json!({
            "level": meta.level().as_str(),
            "target": meta.target(),
            "fields": visitor.0,
        });
        let _ = self.sender.send(line.to_string());
    }
}

#[derive(Default)]
struct FieldVisitor(HashMap<String, String>);

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }
}
