//! Process-wide metric registry keyed by prefix.
//!
//! Every subsystem that emits metrics asks for a [`Metrics`] handle via
//! [`for_prefix`]. Handles are memoized per prefix, and within a handle each
//! metric name is bound once to a single vector (type plus label key set).
//! Later requests with different label values multiplex into the same vector,
//! so re-registration is safe; requests with an incompatible label key set or
//! metric type return an error instead of panicking the collector.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, TextEncoder,
};
use tracing::warn;

use crate::{Error, Result};

/// Upper bound on the number of labels accepted for one metric
pub const MAX_LABEL_COUNT: usize = 20;

/// Path the metrics router serves the registry under
pub const METRICS_ENDPOINT: &str = "/metrics";

static STORE: Lazy<DashMap<String, Arc<Metrics>>> = Lazy::new(DashMap::new);

/// Histogram buckets used when a duration summary is requested.
///
/// The Rust prometheus client has no native summary type; quantiles are left
/// to the backend and observations are recorded into these buckets instead.
const SUMMARY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

enum Vector {
    Counter(IntCounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Vector {
    fn kind(&self) -> &'static str {
        match self {
            Vector::Counter(_) => "counter",
            Vector::Gauge(_) => "gauge",
            Vector::Histogram(_) => "histogram",
        }
    }
}

/// Metric handle scoped to one name prefix.
///
/// Obtained from [`for_prefix`]; cheap to clone through the returned `Arc`.
pub struct Metrics {
    prefix: String,
    const_labels: HashMap<String, String>,
    vectors: Mutex<HashMap<String, Vector>>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("prefix", &self.prefix)
            .field("const_labels", &self.const_labels)
            .finish_non_exhaustive()
    }
}

/// Return the memoized [`Metrics`] handle for `prefix`, creating it on first
/// use.
///
/// `const_labels` are attached to every metric created through the handle and
/// only take effect on the call that creates the handle.
pub fn for_prefix(
    prefix: &str,
    const_labels: Option<HashMap<String, String>>,
) -> Result<Arc<Metrics>> {
    let const_labels = const_labels.unwrap_or_default();
    if const_labels.len() > MAX_LABEL_COUNT {
        return Err(Error::metrics(format!(
            "label count exceeded, max is {MAX_LABEL_COUNT}"
        )));
    }

    let entry = STORE
        .entry(prefix.to_string())
        .or_insert_with(|| {
            Arc::new(Metrics {
                prefix: format!("{}_", prefix.trim_end_matches('_')),
                const_labels,
                vectors: Mutex::new(HashMap::new()),
            })
        })
        .clone();
    Ok(entry)
}

impl Metrics {
    /// Counter without dynamic labels.
    pub fn counter(&self, name: &str) -> Result<IntCounter> {
        self.counter_with_labels(name, &HashMap::new())
    }

    /// Counter multiplexed by the given label values.
    pub fn counter_with_labels(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<IntCounter> {
        check_label_count(labels)?;
        let mut vectors = self.vectors.lock().expect("metrics mutex poisoned");
        let vector = match vectors.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let keys = sorted_keys(labels);
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let vec = IntCounterVec::new(self.opts(name), &key_refs)?;
                register(&vec);
                entry.insert(Vector::Counter(vec))
            }
        };
        match vector {
            Vector::Counter(vec) => Ok(vec.get_metric_with(&as_ref_map(labels))?),
            other => Err(type_mismatch(name, "counter", other.kind())),
        }
    }

    /// Gauge without dynamic labels.
    pub fn gauge(&self, name: &str) -> Result<Gauge> {
        self.gauge_with_labels(name, &HashMap::new())
    }

    /// Gauge multiplexed by the given label values.
    pub fn gauge_with_labels(&self, name: &str, labels: &HashMap<String, String>) -> Result<Gauge> {
        check_label_count(labels)?;
        let mut vectors = self.vectors.lock().expect("metrics mutex poisoned");
        let vector = match vectors.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let keys = sorted_keys(labels);
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let vec = GaugeVec::new(self.opts(name), &key_refs)?;
                register(&vec);
                entry.insert(Vector::Gauge(vec))
            }
        };
        match vector {
            Vector::Gauge(vec) => Ok(vec.get_metric_with(&as_ref_map(labels))?),
            other => Err(type_mismatch(name, "gauge", other.kind())),
        }
    }

    /// Histogram with explicit buckets, without dynamic labels.
    pub fn histogram(&self, name: &str, buckets: Vec<f64>) -> Result<Histogram> {
        self.histogram_with_labels(name, buckets, &HashMap::new())
    }

    /// Histogram with explicit buckets, multiplexed by the given label values.
    pub fn histogram_with_labels(
        &self,
        name: &str,
        buckets: Vec<f64>,
        labels: &HashMap<String, String>,
    ) -> Result<Histogram> {
        check_label_count(labels)?;
        let mut vectors = self.vectors.lock().expect("metrics mutex poisoned");
        let vector = match vectors.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let keys = sorted_keys(labels);
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let buckets = if buckets.is_empty() {
                    SUMMARY_BUCKETS.to_vec()
                } else {
                    buckets
                };
                let opts = HistogramOpts::new(self.full_name(name), help_for(name))
                    .const_labels(self.const_labels.clone())
                    .buckets(buckets);
                let vec = HistogramVec::new(opts, &key_refs)?;
                register(&vec);
                entry.insert(Vector::Histogram(vec))
            }
        };
        match vector {
            Vector::Histogram(vec) => Ok(vec.get_metric_with(&as_ref_map(labels))?),
            other => Err(type_mismatch(name, "histogram", other.kind())),
        }
    }

    /// Duration summary, multiplexed by the given label values.
    ///
    /// Recorded as a histogram with duration buckets; see [`SUMMARY_BUCKETS`].
    pub fn summary_with_labels(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Histogram> {
        self.histogram_with_labels(name, Vec::new(), labels)
    }

    /// Remove the series identified by the exact label values from a vector.
    ///
    /// Returns false when the metric name is unknown or the series does not
    /// exist.
    pub fn delete_with_labels(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        let vectors = self.vectors.lock().expect("metrics mutex poisoned");
        let Some(vector) = vectors.get(name) else {
            return false;
        };
        let labels = as_ref_map(labels);
        match vector {
            Vector::Counter(vec) => vec.remove(&labels).is_ok(),
            Vector::Gauge(vec) => vec.remove(&labels).is_ok(),
            Vector::Histogram(vec) => vec.remove(&labels).is_ok(),
        }
    }

    /// Unregister every vector created through this handle and drop them from
    /// the handle. Mostly useful for teardown in embedding processes.
    pub fn unregister_all(&self) {
        let mut vectors = self.vectors.lock().expect("metrics mutex poisoned");
        for (_, vector) in vectors.drain() {
            let result = match vector {
                Vector::Counter(vec) => prometheus::default_registry().unregister(Box::new(vec)),
                Vector::Gauge(vec) => prometheus::default_registry().unregister(Box::new(vec)),
                Vector::Histogram(vec) => prometheus::default_registry().unregister(Box::new(vec)),
            };
            if let Err(err) = result {
                warn!(error = %err, "failed to unregister metric vector");
            }
        }
    }

    fn opts(&self, name: &str) -> Opts {
        Opts::new(self.full_name(name), help_for(name)).const_labels(self.const_labels.clone())
    }

    fn full_name(&self, name: &str) -> String {
        sanitize(&format!("{}{}", self.prefix, name))
    }
}

/// Router serving the process-wide registry at [`METRICS_ENDPOINT`].
pub fn router() -> Router {
    Router::new().route(METRICS_ENDPOINT, get(serve_metrics))
}

async fn serve_metrics() -> (StatusCode, String) {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    match TextEncoder::new().encode(&families, &mut buf) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8(buf).unwrap_or_default(),
        ),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: &C) {
    // Registration conflicts are logged, not fatal: the memoized vector is
    // still usable by the caller that created it.
    if let Err(err) = prometheus::default_registry().register(Box::new(collector.clone())) {
        warn!(error = %err, "metric registration conflict");
    }
}

/// Only `[a-zA-Z0-9_:]` are valid in metric names; anything else becomes `_`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn help_for(name: &str) -> String {
    format!("{name} metric")
}

fn check_label_count(labels: &HashMap<String, String>) -> Result<()> {
    if labels.len() > MAX_LABEL_COUNT {
        return Err(Error::metrics(format!(
            "label count exceeded, max is {MAX_LABEL_COUNT}"
        )));
    }
    Ok(())
}

fn type_mismatch(name: &str, wanted: &str, got: &str) -> Error {
    Error::metrics(format!(
        "metric {name} already registered as {got}, requested {wanted}"
    ))
}

fn sorted_keys(labels: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = labels.keys().cloned().collect();
    keys.sort();
    keys
}

fn as_ref_map(labels: &HashMap<String, String>) -> HashMap<&str, &str> {
    labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_memoized_per_prefix() {
        let a = for_prefix("memoized_test", None).unwrap();
        let b = for_prefix("memoized_test", None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = for_prefix("memoized_test_other", None).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn trailing_underscores_are_normalized() {
        let m = for_prefix("normalize_test___", None).unwrap();
        let counter = m.counter("hits").unwrap();
        counter.inc();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn label_count_is_capped() {
        let labels: HashMap<String, String> = (0..=MAX_LABEL_COUNT)
            .map(|i| (format!("k{i}"), format!("v{i}")))
            .collect();
        let err = for_prefix("label_cap_test", Some(labels.clone())).unwrap_err();
        assert!(err.to_string().contains("label count exceeded"));

        let m = for_prefix("label_cap_test", None).unwrap();
        let err = m.counter_with_labels("hits", &labels).unwrap_err();
        assert!(err.to_string().contains("label count exceeded"));
    }

    #[test]
    fn same_vector_multiplexes_by_label_values() {
        let m = for_prefix("multiplex_test", None).unwrap();
        let labels_a: HashMap<String, String> =
            [("queuename".to_string(), "a".to_string())].into();
        let labels_b: HashMap<String, String> =
            [("queuename".to_string(), "b".to_string())].into();

        let a = m.counter_with_labels("dequeue_total", &labels_a).unwrap();
        let b = m.counter_with_labels("dequeue_total", &labels_b).unwrap();
        a.inc();
        a.inc();
        b.inc();
        assert_eq!(a.get(), 2);
        assert_eq!(b.get(), 1);

        // Re-requesting the same series yields the same underlying counter.
        let a2 = m.counter_with_labels("dequeue_total", &labels_a).unwrap();
        assert_eq!(a2.get(), 2);
    }

    #[test]
    fn incompatible_label_keys_error() {
        let m = for_prefix("incompatible_keys_test", None).unwrap();
        let labels: HashMap<String, String> = [("q".to_string(), "a".to_string())].into();
        m.counter_with_labels("total", &labels).unwrap();

        let other: HashMap<String, String> = [("other".to_string(), "a".to_string())].into();
        assert!(m.counter_with_labels("total", &other).is_err());
    }

    #[test]
    fn metric_type_conflicts_error() {
        let m = for_prefix("type_conflict_test", None).unwrap();
        m.counter("value").unwrap();
        let err = m.gauge("value").unwrap_err();
        assert!(err.to_string().contains("already registered as counter"));
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize("workqueue_my-queue.total"), "workqueue_my_queue_total");
        assert_eq!(sanitize("ok:name_09"), "ok:name_09");
    }

    #[test]
    fn delete_with_labels_removes_one_series() {
        let m = for_prefix("delete_series_test", None).unwrap();
        let labels: HashMap<String, String> = [("q".to_string(), "a".to_string())].into();
        let counter = m.counter_with_labels("total", &labels).unwrap();
        counter.inc();

        assert!(m.delete_with_labels("total", &labels));
        assert!(!m.delete_with_labels("total", &labels));
        assert!(!m.delete_with_labels("unknown", &labels));
    }

    #[test]
    fn summary_records_into_histogram() {
        let m = for_prefix("summary_test", None).unwrap();
        let labels: HashMap<String, String> = [("q".to_string(), "a".to_string())].into();
        let h = m.summary_with_labels("reconcile_duration", &labels).unwrap();
        h.observe(0.02);
        h.observe(1.5);
        assert_eq!(h.get_sample_count(), 2);
    }
}
