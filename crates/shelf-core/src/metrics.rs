//! Process-local counter and gauge registry.
//!
//! Series are keyed by `name{label=value,...}` with labels sorted by name,
//! so the same label set always lands on the same series regardless of the
//! order callers pass it in. [`Metrics::render_prometheus`] produces the
//! text exposition format served at `GET /internal/metrics`.

use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Series {
    counters: BTreeMap<String, f64>,
    gauges: BTreeMap<String, f64>,
}

#[derive(Default)]
pub struct Metrics {
    series: Mutex<Series>,
}

/// Format a series key. Label values are escaped for the text format.
pub fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<(&str, &str)> = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let body: Vec<String> = sorted
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{}{{{}}}", name, body.join(","))
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.inc_by(name, labels, 1.0);
    }

    pub fn inc_by(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        let key = series_key(name, labels);
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        *series.counters.entry(key).or_insert(0.0) += by;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = series_key(name, labels);
        let mut series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.gauges.insert(key, value);
    }

    /// Current counter value; zero when never incremented.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = series_key(name, labels);
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.counters.get(&key).copied().unwrap_or(0.0)
    }

    /// Sum of every series of `name`, whatever the labels.
    pub fn counter_total(&self, name: &str) -> f64 {
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series
            .counters
            .iter()
            .filter(|(k, _)| *k == name || k.starts_with(&format!("{}{{", name)))
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(name, labels);
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        series.gauges.get(&key).copied()
    }

    pub fn render_prometheus(&self) -> String {
        let series = self.series.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        let mut last_name = String::new();
        for (kind, map) in [("counter", &series.counters), ("gauge", &series.gauges)] {
            for (key, value) in map.iter() {
                let name = key.split('{').next().unwrap_or(key);
                if name != last_name {
                    out.push_str(&format!("# TYPE {} {}\n", name, kind));
                    last_name = name.to_string();
                }
                out.push_str(&format!("{} {}\n", key, value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_does_not_matter() {
        let m = Metrics::new();
        m.inc("chat_turn_total", &[("route", "tool"), ("status", "ok")]);
        m.inc("chat_turn_total", &[("status", "ok"), ("route", "tool")]);
        assert_eq!(
            m.counter("chat_turn_total", &[("route", "tool"), ("status", "ok")]),
            2.0
        );
    }

    #[test]
    fn test_counter_total_sums_series() {
        let m = Metrics::new();
        m.inc("x_total", &[("kind", "a")]);
        m.inc_by("x_total", &[("kind", "b")], 2.0);
        m.inc("x_total_other", &[]);
        assert_eq!(m.counter_total("x_total"), 3.0);
    }

    #[test]
    fn test_render_prometheus() {
        let m = Metrics::new();
        m.inc("a_total", &[("k", "v")]);
        m.set_gauge("health", &[("provider", "primary")], 0.5);
        let text = m.render_prometheus();
        assert!(text.contains("# TYPE a_total counter"));
        assert!(text.contains("a_total{k=\"v\"} 1"));
        assert!(text.contains("health{provider=\"primary\"} 0.5"));
    }
}
