//! Pull destination: the latest sample of every series, rendered for scrapers.

use super::Destination;
use crate::batcher::Batch;
use crate::error::DeliveryError;
use async_trait::async_trait;
use shared::models::{Exemplar, MetricKind, MetricPoint, MetricValue};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, PoisonError, RwLock};

/// Content type of the classic text exposition format.
pub const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Content type of the OpenMetrics exposition format.
pub const CONTENT_TYPE_OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Label carrying the producing service.
const SERVICE_LABEL: &str = "service_name";

type Labels = Vec<(String, String)>;

#[derive(Debug, Clone)]
struct Sample {
    value: MetricValue,
    exemplars: Vec<Exemplar>,
}

#[derive(Debug)]
struct Family {
    kind: MetricKind,
    help: String,
    series: BTreeMap<Labels, Sample>,
}

/// Latest samples of every series delivered to a `prometheus` exporter.
#[derive(Debug, Default)]
pub struct ScrapeRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

impl ScrapeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry wrapped in an Arc.
    #[must_use]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of series held.
    #[must_use]
    pub fn series_count(&self) -> usize {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        families.values().map(|f| f.series.len()).sum()
    }

    /// Replaces the samples of the given points' series.
    pub fn update(&self, points: &[MetricPoint]) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        for point in points {
            let name = sanitize_metric_name(&point.name);
            let family = families.entry(name).or_insert_with(|| Family {
                kind: point.kind,
                help: point.description.clone(),
                series: BTreeMap::new(),
            });
            if family.kind != point.kind {
                tracing::debug!(metric = %point.name, kind = %point.kind, "Ignoring point of conflicting kind");
                continue;
            }
            if family.help.is_empty() && !point.description.is_empty() {
                family.help.clone_from(&point.description);
            }
            let key = labels(point);
            let exemplars = match family.series.get(&key) {
                Some(previous) if point.exemplars.is_empty() => previous.exemplars.clone(),
                _ => point.exemplars.clone(),
            };
            family.series.insert(
                key,
                Sample {
                    value: point.value.clone(),
                    exemplars,
                },
            );
        }
    }

    /// Renders every series in the text format, or OpenMetrics with exemplars.
    #[must_use]
    pub fn render(&self, openmetrics: bool) -> String {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for (name, family) in families.iter() {
            render_family(&mut out, name, family, openmetrics);
        }
        if openmetrics {
            out.push_str("# EOF\n");
        }
        out
    }
}

fn labels(point: &MetricPoint) -> Labels {
    let mut labels: Labels = point
        .attributes
        .iter()
        .map(|(k, v)| (sanitize_label_name(k), v.to_string()))
        .filter(|(k, _)| k != SERVICE_LABEL && k != "le")
        .collect();
    labels.push((SERVICE_LABEL.to_string(), point.resource.service_name().to_string()));
    labels.sort();
    labels.dedup_by(|a, b| a.0 == b.0);
    labels
}

fn render_family(out: &mut String, name: &str, family: &Family, openmetrics: bool) {
    let (family_name, sample_name) = match family.kind {
        MetricKind::Counter if openmetrics => {
            let base = name.strip_suffix("_total").unwrap_or(name);
            (base.to_string(), format!("{base}_total"))
        }
        _ => (name.to_string(), name.to_string()),
    };

    if !family.help.is_empty() {
        let _ = writeln!(out, "# HELP {family_name} {}", escape_help(&family.help));
    }
    let _ = writeln!(out, "# TYPE {family_name} {}", family.kind);

    for (labels, sample) in &family.series {
        match &sample.value {
            MetricValue::Number(value) => {
                let _ = write!(out, "{sample_name}{} {}", format_labels(labels, None), format_value(*value));
                if openmetrics && family.kind == MetricKind::Counter {
                    if let Some(exemplar) = sample.exemplars.last() {
                        write_exemplar(out, exemplar);
                    }
                }
                out.push('\n');
            }
            MetricValue::Histogram(histogram) => {
                let cumulative = histogram.cumulative_counts();
                for (i, count) in cumulative.iter().enumerate() {
                    let (le, lower) = match histogram.bounds.get(i) {
                        Some(bound) => (format_value(*bound), i.checked_sub(1).and_then(|j| histogram.bounds.get(j))),
                        None => ("+Inf".to_string(), histogram.bounds.last()),
                    };
                    let _ = write!(out, "{name}_bucket{} {count}", format_labels(labels, Some(&le)));
                    if openmetrics {
                        let upper = histogram.bounds.get(i).copied().unwrap_or(f64::INFINITY);
                        let in_bucket = sample.exemplars.iter().rev().find(|e| {
                            e.value <= upper && lower.map_or(true, |l| e.value > *l)
                        });
                        if let Some(exemplar) = in_bucket {
                            write_exemplar(out, exemplar);
                        }
                    }
                    out.push('\n');
                }
                let _ = writeln!(out, "{name}_sum{} {}", format_labels(labels, None), format_value(histogram.sum));
                let _ = writeln!(out, "{name}_count{} {}", format_labels(labels, None), histogram.count);
            }
        }
    }
}

fn write_exemplar(out: &mut String, exemplar: &Exemplar) {
    let _ = write!(
        out,
        " # {{trace_id=\"{}\",span_id=\"{}\"}} {}",
        exemplar.trace_id,
        exemplar.span_id,
        format_value(exemplar.value)
    );
}

fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn sanitize(name: &str, allow_colon: bool) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Maps an OTLP metric name onto the Prometheus name charset.
#[must_use]
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Maps an attribute key onto the Prometheus label name charset.
#[must_use]
pub fn sanitize_label_name(name: &str) -> String {
    sanitize(name, false)
}

/// Updates a scrape registry; never fails.
pub struct PrometheusDestination {
    registry: Arc<ScrapeRegistry>,
}

impl PrometheusDestination {
    /// Creates a destination feeding `registry`.
    #[must_use]
    pub fn new(registry: Arc<ScrapeRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Destination<MetricPoint> for PrometheusDestination {
    fn kind(&self) -> &'static str {
        "prometheus"
    }

    async fn deliver(&self, batch: &Batch<MetricPoint>) -> Result<(), DeliveryError> {
        self.registry.update(batch.records());
        Ok(())
    }
}
