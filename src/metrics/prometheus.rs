//! In-memory aggregating exporter producing Prometheus-style text.
//! Labels carry node UUID, node hostname, optional alternate hostname,
//! bucket, and agent identifier (the `agent` label is the user-agent
//! fragment negotiated during the connection handshake).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{HistogramFamily, Meter, Recorder};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels {
    pub node_uuid: Option<String>,
    pub node_hostname: Option<String>,
    pub alternate_hostname: Option<String>,
    pub bucket: Option<String>,
    pub agent: Option<String>,
}

impl Labels {
    fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = &self.node_uuid {
            parts.push(format!("node_uuid=\"{v}\""));
        }
        if let Some(v) = &self.node_hostname {
            parts.push(format!("node_hostname=\"{v}\""));
        }
        if let Some(v) = &self.alternate_hostname {
            parts.push(format!("alternate_hostname=\"{v}\""));
        }
        if let Some(v) = &self.bucket {
            parts.push(format!("bucket=\"{v}\""));
        }
        if let Some(v) = &self.agent {
            parts.push(format!("agent=\"{v}\""));
        }
        parts.join(",")
    }
}

#[derive(Default)]
struct HistogramState {
    bucket_counts: Vec<u64>,
    sum_ms: u64,
    count: u64,
}

#[derive(Default)]
struct CounterState {
    total: u64,
    timed_out: u64,
    canceled: u64,
}

#[derive(Default)]
struct Registry {
    histograms: HashMap<(HistogramFamily, Labels), HistogramState>,
    counters: HashMap<(&'static str, Labels), CounterState>,
}

pub struct PrometheusMeter {
    registry: Mutex<Registry>,
}

impl PrometheusMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(PrometheusMeter {
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn record_histogram(&self, family: HistogramFamily, labels: &Labels, value_ms: i64) {
        let mut guard = self.registry.lock().unwrap();
        let boundaries = family.bucket_boundaries_ms();
        let entry = guard
            .histograms
            .entry((family, labels.clone()))
            .or_insert_with(|| HistogramState {
                bucket_counts: vec![0; boundaries.len() + 1],
                sum_ms: 0,
                count: 0,
            });
        let value = value_ms.max(0) as u64;
        let mut placed = false;
        for (i, bound) in boundaries.iter().enumerate() {
            if value <= *bound {
                entry.bucket_counts[i] += 1;
                placed = true;
                break;
            }
        }
        if !placed {
            *entry.bucket_counts.last_mut().unwrap() += 1;
        }
        entry.sum_ms += value;
        entry.count += 1;
    }

    pub fn increment_total(&self, service: &'static str, labels: &Labels) {
        self.with_counter(service, labels, |c| c.total += 1);
    }
    pub fn increment_timed_out(&self, service: &'static str, labels: &Labels) {
        self.with_counter(service, labels, |c| c.timed_out += 1);
    }
    pub fn increment_canceled(&self, service: &'static str, labels: &Labels) {
        self.with_counter(service, labels, |c| c.canceled += 1);
    }

    fn with_counter(&self, service: &'static str, labels: &Labels, f: impl FnOnce(&mut CounterState)) {
        let mut guard = self.registry.lock().unwrap();
        let entry = guard
            .counters
            .entry((service, labels.clone()))
            .or_insert_with(CounterState::default);
        f(entry);
    }

    /// Renders the full registry as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let guard = self.registry.lock().unwrap();
        let mut out = String::new();
        for ((family, labels), state) in guard.histograms.iter() {
            let name = family.metric_name();
            let boundaries = family.bucket_boundaries_ms();
            let mut cumulative = 0u64;
            for (i, bound) in boundaries.iter().enumerate() {
                cumulative += state.bucket_counts[i];
                out.push_str(&format!(
                    "{name}_bucket{{{},le=\"{bound}\"}} {cumulative}\n",
                    labels.render()
                ));
            }
            cumulative += *state.bucket_counts.last().unwrap();
            out.push_str(&format!(
                "{name}_bucket{{{},le=\"+Inf\"}} {cumulative}\n",
                labels.render()
            ));
            out.push_str(&format!("{name}_sum{{{}}} {}\n", labels.render(), state.sum_ms));
            out.push_str(&format!("{name}_count{{{}}} {}\n", labels.render(), state.count));
        }
        for ((service, labels), state) in guard.counters.iter() {
            out.push_str(&format!(
                "{service}_r_total{{{}}} {}\n",
                labels.render(),
                state.total
            ));
            out.push_str(&format!(
                "{service}_r_timedout{{{}}} {}\n",
                labels.render(),
                state.timed_out
            ));
            out.push_str(&format!(
                "{service}_r_canceled{{{}}} {}\n",
                labels.render(),
                state.canceled
            ));
        }
        out
    }
}

struct PrometheusRecorder {
    meter: Arc<PrometheusMeter>,
    family: HistogramFamily,
    labels: Labels,
}

impl Recorder for PrometheusRecorder {
    fn record_value(&self, value: i64) {
        self.meter.record_histogram(self.family, &self.labels, value);
    }
}

impl Meter for PrometheusMeter {
    fn value_recorder(self: Arc<Self>, name: &'static str, tags: Labels) -> Arc<dyn Recorder> {
        let family = match name {
            "kv_durable" => HistogramFamily::KvDurable,
            "http" => HistogramFamily::Http,
            _ => HistogramFamily::KvNonDurable,
        };
        Arc::new(PrometheusRecorder {
            meter: self,
            family,
            labels: tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_bucket_cumulative_counts() {
        let meter = PrometheusMeter::new();
        let labels = Labels {
            bucket: Some("travel-sample".into()),
            ..Default::default()
        };
        meter.record_histogram(HistogramFamily::KvNonDurable, &labels, 5);
        meter.record_histogram(HistogramFamily::KvNonDurable, &labels, 200);
        let rendered = meter.render();
        assert!(rendered.contains("db_kv_nondurable_ms_bucket"));
        assert!(rendered.contains("le=\"+Inf\""));
    }

    #[test]
    fn counters_increment_independently() {
        let meter = PrometheusMeter::new();
        let labels = Labels::default();
        meter.increment_total("kv", &labels);
        meter.increment_total("kv", &labels);
        meter.increment_timed_out("kv", &labels);
        let rendered = meter.render();
        assert!(rendered.contains("kv_r_total"));
        assert!(rendered.contains("kv_r_timedout"));
    }
}
