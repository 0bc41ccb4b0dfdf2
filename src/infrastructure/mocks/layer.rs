//! Tracing layer that records events for assertions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Records every event it sees. Clones share one buffer.
///
/// # Examples
///
/// ```
/// use admission_gate::infrastructure::mocks::MockCaptureLayer;
/// use tracing_subscriber::layer::SubscriberExt;
///
/// let capture = MockCaptureLayer::new();
/// let subscriber = tracing_subscriber::registry().with(capture.clone());
///
/// tracing::subscriber::with_default(subscriber, || {
///     tracing::warn!(user_id = %"alice", "Counter store unavailable");
/// });
///
/// let warnings = capture.warnings();
/// assert_eq!(warnings.len(), 1);
/// assert_eq!(warnings[0].field("user_id"), Some("alice"));
///
/// capture.clear();
/// assert_eq!(capture.count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockCaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

/// One recorded event.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    /// Structured fields other than the message. `%` fields keep their
    /// `Display` form; everything else is formatted with `Debug`.
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl MockCaptureLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of everything recorded so far.
    pub fn get_captured(&self) -> Vec<CapturedEvent> {
        self.events().clone()
    }

    pub fn count(&self) -> usize {
        self.events().len()
    }

    /// Events at `level` whose message contains `needle`.
    pub fn matching(&self, level: Level, needle: &str) -> Vec<CapturedEvent> {
        self.events()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .cloned()
            .collect()
    }

    pub fn warnings(&self) -> Vec<CapturedEvent> {
        self.matching(Level::WARN, "")
    }

    pub fn clear(&self) {
        self.events().clear();
    }
}

impl fmt::Debug for MockCaptureLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockCaptureLayer")
            .field("events", &self.count())
            .finish()
    }
}

impl<S: Subscriber> Layer<S> for MockCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldRecorder::default();
        event.record(&mut fields);

        let metadata = event.metadata();
        self.events().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: fields.message,
            fields: fields.values,
        });
    }
}

#[derive(Default)]
struct FieldRecorder {
    message: String,
    values: BTreeMap<String, String>,
}

impl FieldRecorder {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = value,
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldRecorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, warn};
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_records_levels_and_fields() {
        let capture = MockCaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            debug!(allowed = true, "Admission decision");
            warn!(user_id = %"alice", retry_after = 50u64, "Request rejected");
        });

        assert_eq!(capture.count(), 2);
        let events = capture.get_captured();
        assert_eq!(events[0].level, Level::DEBUG);
        assert_eq!(events[0].message, "Admission decision");
        assert_eq!(events[0].field("allowed"), Some("true"));

        let warnings = capture.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field("user_id"), Some("alice"));
        assert_eq!(warnings[0].field("retry_after"), Some("50"));
        assert!(capture.matching(Level::WARN, "rejected").len() == 1);
    }
}
