//! Metric families and their Prometheus text exposition.

use std::fmt::Write;

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metric types produced by this exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
}

impl MetricType {
    /// Name used on the `# TYPE` line.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
        }
    }
}

/// One labelled value of a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Label values, in the order of the family's label names.
    pub label_values: Vec<String>,
    pub value: f64,
}

/// A named metric with a fixed label schema and zero or more samples.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    name: &'static str,
    help: &'static str,
    metric_type: MetricType,
    label_names: &'static [&'static str],
    samples: Vec<Sample>,
}

impl MetricFamily {
    /// Create an empty gauge family.
    pub fn gauge(
        name: &'static str,
        help: &'static str,
        label_names: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            metric_type: MetricType::Gauge,
            label_names,
            samples: Vec::new(),
        }
    }

    /// Add a sample.
    ///
    /// # Panics
    ///
    /// Panics if the number of label values differs from the number of label
    /// names of this family.
    pub fn add_sample(&mut self, label_values: Vec<String>, value: f64) {
        assert_eq!(
            label_values.len(),
            self.label_names.len(),
            "sample for {} has the wrong number of label values",
            self.name
        );
        self.samples.push(Sample {
            label_values,
            value,
        });
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn help(&self) -> &str {
        self.help
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn label_names(&self) -> &[&'static str] {
        self.label_names
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Format the labels of one sample, e.g. `{uid="tr3289",location="CH"}`.
    fn format_labels(&self, sample: &Sample) -> String {
        if self.label_names.is_empty() {
            return String::new();
        }

        let parts: Vec<String> = self
            .label_names
            .iter()
            .zip(&sample.label_values)
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();

        format!("{{{}}}", parts.join(","))
    }
}

/// Render families in the Prometheus text exposition format.
///
/// Families without samples still get their `# HELP` and `# TYPE` lines.
pub fn encode_text(families: &[MetricFamily]) -> String {
    let mut output = String::with_capacity(families.len() * 200);

    for family in families {
        writeln!(output, "# HELP {} {}", family.name, escape_help(family.help)).ok();
        writeln!(
            output,
            "# TYPE {} {}",
            family.name,
            family.metric_type.as_str()
        )
        .ok();

        for sample in &family.samples {
            writeln!(
                output,
                "{}{} {}",
                family.name,
                family.format_labels(sample),
                format_value(sample.value)
            )
            .ok();
        }
    }

    output
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape special characters in help text.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABELS: &[&str] = &["uid", "nickname", "location"];

    fn labels(uid: &str, nickname: &str, location: &str) -> Vec<String> {
        vec![uid.to_string(), nickname.to_string(), location.to_string()]
    }

    #[test]
    fn test_encode_family_with_samples() {
        let mut family = MetricFamily::gauge("rsyncnet_account_quota_bytes", "Account quota", LABELS);
        family.add_sample(labels("tr3289", "myspace", "CH"), 128849018880.0);

        let output = encode_text(&[family]);
        assert_eq!(
            output,
            "# HELP rsyncnet_account_quota_bytes Account quota\n\
             # TYPE rsyncnet_account_quota_bytes gauge\n\
             rsyncnet_account_quota_bytes{uid=\"tr3289\",nickname=\"myspace\",location=\"CH\"} 128849018880\n"
        );
    }

    #[test]
    fn test_encode_empty_family_keeps_declaration() {
        let family = MetricFamily::gauge("rsyncnet_account_idle_seconds", "Idle", LABELS);

        let output = encode_text(&[family]);
        assert_eq!(
            output,
            "# HELP rsyncnet_account_idle_seconds Idle\n\
             # TYPE rsyncnet_account_idle_seconds gauge\n"
        );
    }

    #[test]
    fn test_label_order_follows_family() {
        let mut family = MetricFamily::gauge("m", "h", &["z", "a"]);
        family.add_sample(vec!["1".to_string(), "2".to_string()], 1.0);

        assert!(encode_text(&[family]).contains("m{z=\"1\",a=\"2\"} 1\n"));
    }

    #[test]
    #[should_panic(expected = "wrong number of label values")]
    fn test_add_sample_checks_arity() {
        let mut family = MetricFamily::gauge("m", "h", LABELS);
        family.add_sample(vec!["only-one".to_string()], 1.0);
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("simple"), "simple");
        assert_eq!(escape_label_value("with\"quote"), "with\\\"quote");
        assert_eq!(escape_label_value("with\\backslash"), "with\\\\backslash");
        assert_eq!(escape_label_value("with\nnewline"), "with\\nnewline");
    }

    #[test]
    fn test_escape_help() {
        assert_eq!(escape_help("a\\b\nc"), "a\\\\b\\nc");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(2.5), "2.5");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
    }
}
