//! Threshold/orphan-sampling tracer.
//!
//! Spans whose service is known and whose duration exceeds the
//! per-service threshold feed a bounded max-heap sized to
//! `threshold_sample_size`; spans tagged `orphan` feed a separate bounded
//! heap. Two timers periodically drain and log JSON reports of the top
//! offenders.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Span, TagValue, Tracer};

#[derive(Debug, Clone)]
pub struct ThresholdTracerConfig {
    /// Per-service duration threshold above which a span is "slow enough to report".
    pub service_thresholds: HashMap<&'static str, Duration>,
    pub threshold_sample_size: usize,
    pub orphan_sample_size: usize,
    pub emit_interval: Duration,
}

impl Default for ThresholdTracerConfig {
    fn default() -> Self {
        let mut service_thresholds = HashMap::new();
        service_thresholds.insert("kv", Duration::from_millis(500));
        service_thresholds.insert("query", Duration::from_secs(1));
        service_thresholds.insert("search", Duration::from_secs(1));
        service_thresholds.insert("analytics", Duration::from_secs(1));
        service_thresholds.insert("views", Duration::from_secs(1));
        ThresholdTracerConfig {
            service_thresholds,
            threshold_sample_size: 10,
            orphan_sample_size: 10,
            emit_interval: Duration::from_secs(10),
        }
    }
}

struct SampledSpan {
    duration: Duration,
    name: &'static str,
    operation_id: Option<String>,
    last_local_socket: Option<String>,
    last_remote_socket: Option<String>,
    last_server_duration: Option<Duration>,
    total_server_duration: Duration,
}

impl PartialEq for SampledSpan {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration
    }
}
impl Eq for SampledSpan {}
impl PartialOrd for SampledSpan {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for SampledSpan {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse so the heap's "greatest" is the *smallest* duration,
        // letting us cheaply evict the least-interesting sample when full.
        other.duration.cmp(&self.duration)
    }
}

struct Heaps {
    threshold: BinaryHeap<SampledSpan>,
    orphan: BinaryHeap<SampledSpan>,
}

pub struct ThresholdOrphanTracer {
    config: ThresholdTracerConfig,
    heaps: Mutex<Heaps>,
}

impl ThresholdOrphanTracer {
    pub fn new(config: ThresholdTracerConfig) -> Arc<Self> {
        Arc::new(ThresholdOrphanTracer {
            config,
            heaps: Mutex::new(Heaps {
                threshold: BinaryHeap::new(),
                orphan: BinaryHeap::new(),
            }),
        })
    }

    fn tag_str(span: &Span, key: &str) -> Option<String> {
        span.tags().into_iter().find_map(|(k, v)| {
            if k == key {
                match v {
                    TagValue::Str(s) => Some(s),
                    TagValue::UInt(n) => Some(n.to_string()),
                }
            } else {
                None
            }
        })
    }

    fn is_orphan(span: &Span) -> bool {
        span.tags().iter().any(|(k, v)| {
            *k == "orphan" && matches!(v, TagValue::Str(s) if s == "true")
        })
    }

    /// Drains both heaps and renders a JSON report of the top offenders.
    /// Called by the emit timer; exposed so callers can also force a flush.
    pub fn drain_and_report(&self) -> serde_json::Value {
        let mut guard = self.heaps.lock().unwrap();
        let render = |heap: &mut BinaryHeap<SampledSpan>| -> Vec<serde_json::Value> {
            let mut items: Vec<SampledSpan> = heap.drain().collect();
            items.sort_by(|a, b| b.duration.cmp(&a.duration));
            items
                .into_iter()
                .map(|s| {
                    serde_json::json!({
                        "operation_name": s.name,
                        "duration_us": s.duration.as_micros() as u64,
                        "last_operation_id": s.operation_id,
                        "last_local_socket": s.last_local_socket,
                        "last_remote_socket": s.last_remote_socket,
                        "last_server_duration_us": s.last_server_duration.map(|d| d.as_micros() as u64),
                        "total_server_duration_us": s.total_server_duration.as_micros() as u64,
                    })
                })
                .collect()
        };
        let threshold_report = render(&mut guard.threshold);
        let orphan_report = render(&mut guard.orphan);
        serde_json::json!({
            "top_threshold": threshold_report,
            "top_orphan": orphan_report,
        })
    }

    fn push_bounded(heap: &mut BinaryHeap<SampledSpan>, item: SampledSpan, cap: usize) {
        if heap.len() < cap {
            heap.push(item);
        } else if let Some(smallest) = heap.peek() {
            if item.duration > smallest.duration {
                heap.pop();
                heap.push(item);
            }
        }
    }
}

impl Tracer for ThresholdOrphanTracer {
    fn start_span(self: Arc<Self>, name: &'static str, parent: Option<Arc<Span>>) -> Arc<Span> {
        Arc::new(Span {
            name,
            start: std::time::Instant::now(),
            parent,
            tags: Mutex::new(Vec::new()),
            tracer: self,
            ended: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn on_span_end(self: Arc<Self>, span: Arc<Span>) {
        let duration = span.duration();
        let service = Self::tag_str(&span, "service");
        let operation_id = Self::tag_str(&span, "operation_id");
        let last_local_socket = Self::tag_str(&span, "local_socket");
        let last_remote_socket = Self::tag_str(&span, "remote_socket");
        let last_server_duration = Self::tag_str(&span, "server_duration_us")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_micros);
        let total_server_duration = last_server_duration.unwrap_or_default();

        let sampled = SampledSpan {
            duration,
            name: span.name,
            operation_id,
            last_local_socket,
            last_remote_socket,
            last_server_duration,
            total_server_duration,
        };

        let mut guard = self.heaps.lock().unwrap();
        if Self::is_orphan(&span) {
            Self::push_bounded(&mut guard.orphan, sampled, self.config.orphan_sample_size);
            return;
        }
        if let Some(service) = service {
            if let Some(threshold) = self.config.service_thresholds.get(service.as_str()) {
                if duration > *threshold {
                    Self::push_bounded(&mut guard.threshold, sampled, self.config.threshold_sample_size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_span_is_sampled_into_threshold_heap() {
        let mut config = ThresholdTracerConfig::default();
        config.service_thresholds.insert("kv", Duration::from_millis(0));
        let tracer = ThresholdOrphanTracer::new(config);
        let span = Arc::clone(&tracer).start_span("kv_get", None);
        span.add_tag("service", "kv");
        std::thread::sleep(Duration::from_millis(2));
        span.end();
        let report = tracer.drain_and_report();
        assert_eq!(report["top_threshold"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn heap_stays_bounded_to_sample_size() {
        let mut config = ThresholdTracerConfig::default();
        config.service_thresholds.insert("kv", Duration::from_millis(0));
        config.threshold_sample_size = 2;
        let tracer = ThresholdOrphanTracer::new(config);
        for _ in 0..10 {
            let span = Arc::clone(&tracer).start_span("kv_get", None);
            span.add_tag("service", "kv");
            span.end();
        }
        let report = tracer.drain_and_report();
        assert!(report["top_threshold"].as_array().unwrap().len() <= 2);
    }

    #[test]
    fn orphan_tagged_span_goes_to_orphan_heap() {
        let tracer = ThresholdOrphanTracer::new(ThresholdTracerConfig::default());
        let span = Arc::clone(&tracer).start_span("kv_get", None);
        span.add_tag("orphan", "true");
        span.end();
        let report = tracer.drain_and_report();
        assert_eq!(report["top_orphan"].as_array().unwrap().len(), 1);
    }
}
