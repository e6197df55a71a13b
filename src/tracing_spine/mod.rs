//! Tracer: creates spans; two built-in strategies.
//!
//! Named `tracing_spine` (not `tracing`) to avoid shadowing the `tracing`
//! crate this module is built on top of for its own internal logging.

mod threshold;

pub use threshold::{ThresholdOrphanTracer, ThresholdTracerConfig};

use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub enum TagValue {
    Str(String),
    UInt(u64),
}

/// A span handle. Spans form a tree via `parent`; `end()` finalizes
/// duration and hands the span to the owning tracer for sampling.
pub struct Span {
    pub name: &'static str,
    pub start: Instant,
    pub parent: Option<Arc<Span>>,
    tags: std::sync::Mutex<Vec<(&'static str, TagValue)>>,
    tracer: Arc<dyn Tracer>,
    ended: std::sync::atomic::AtomicBool,
}

impl Span {
    pub fn add_tag(&self, name: &'static str, value: impl Into<TagValue>) {
        self.tags.lock().unwrap().push((name, value.into()));
    }

    pub fn tags(&self) -> Vec<(&'static str, TagValue)> {
        self.tags.lock().unwrap().clone()
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Finalizes the span. Idempotent: a second call is a no-op.
    pub fn end(self: Arc<Self>) {
        if self
            .ended
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
        {
            self.tracer.clone().on_span_end(self.clone());
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Str(s.to_string())
    }
}
impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Str(s)
    }
}
impl From<u64> for TagValue {
    fn from(v: u64) -> Self {
        TagValue::UInt(v)
    }
}

pub trait Tracer: Send + Sync {
    fn start_span(self: Arc<Self>, name: &'static str, parent: Option<Arc<Span>>) -> Arc<Span>;

    /// Called by `Span::end`; built-ins use this to decide whether to
    /// sample the span into a threshold/orphan heap.
    fn on_span_end(self: Arc<Self>, span: Arc<Span>);
}

/// Zero-cost tracer: returns a shared singleton span and never samples.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(self: Arc<Self>, name: &'static str, parent: Option<Arc<Span>>) -> Arc<Span> {
        Arc::new(Span {
            name,
            start: Instant::now(),
            parent,
            tags: std::sync::Mutex::new(Vec::new()),
            tracer: self,
            ended: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn on_span_end(self: Arc<Self>, _span: Arc<Span>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_tracer_span_lifecycle() {
        let tracer: Arc<dyn Tracer> = Arc::new(NoopTracer);
        let span = tracer.clone().start_span("kv_get", None);
        span.add_tag("service", "kv");
        span.end();
    }
}
