use conveyor::metrics::MetricsSink;
use std::sync::{Arc, Mutex};

/// Metrics backend capturing every counter increment for assertions.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    counters: Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        RecordingMetrics::default()
    }

    pub fn counters(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.counters.lock().expect("lock").clone()
    }

    /// Number of increments of `name` carrying `result` as their result tag.
    pub fn count_with_result(&self, name: &str, result: &str) -> usize {
        self.counters()
            .iter()
            .filter(|(metric, tags)| {
                metric == name
                    && tags
                        .iter()
                        .any(|(tag, value)| tag == "result" && value == result)
            })
            .count()
    }

    /// Number of increments of `name`, regardless of tags.
    pub fn count(&self, name: &str) -> usize {
        self.counters()
            .iter()
            .filter(|(metric, _)| metric == name)
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &str, tags: &[(String, String)]) {
        self.counters
            .lock()
            .expect("lock")
            .push((name.to_string(), tags.to_vec()));
    }

    fn gauge(&self, _name: &str, _value: f64, _tags: &[(String, String)]) {}
}
