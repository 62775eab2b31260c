//! Prometheus text exposition format.

use std::fmt::Write as _;

/// The content type of the rendered payload.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Prometheus metric type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MetricKind {
    /// A monotonically increasing value.
    Counter,

    /// A value that can go up and down.
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// Builds a Prometheus text payload.
///
/// Each family is started with [`family`][Self::family], followed by its samples. Samples for a family must be written
/// before the next family is started.
#[derive(Default)]
pub struct PrometheusWriter {
    buffer: String,
    name_buf: String,
}

impl PrometheusWriter {
    /// Creates a new, empty `PrometheusWriter`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the `HELP` and `TYPE` header lines for a family.
    pub fn family(&mut self, name: &str, help: Option<&str>, kind: MetricKind) {
        normalize_metric_name(name, &mut self.name_buf);

        if let Some(help) = help {
            let _ = writeln!(self.buffer, "# HELP {} {}", self.name_buf, escape_help(help));
        }
        let _ = writeln!(self.buffer, "# TYPE {} {}", self.name_buf, kind.as_str());
    }

    /// Writes a single sample.
    pub fn sample(&mut self, name: &str, labels: &[(&str, &str)], value: f64) {
        normalize_metric_name(name, &mut self.name_buf);
        self.buffer.push_str(&self.name_buf);

        if !labels.is_empty() {
            self.buffer.push('{');
            for (i, (label_name, label_value)) in labels.iter().enumerate() {
                if i != 0 {
                    self.buffer.push(',');
                }
                normalize_metric_name(label_name, &mut self.name_buf);
                let _ = write!(self.buffer, "{}=\"{}\"", self.name_buf, escape_label_value(label_value));
            }
            self.buffer.push('}');
        }

        self.buffer.push(' ');
        write_value(&mut self.buffer, value);
        self.buffer.push('\n');
    }

    /// Consumes the writer, returning the payload.
    pub fn finish(self) -> String {
        self.buffer
    }
}

fn write_value(buffer: &mut String, value: f64) {
    if value.is_nan() {
        buffer.push_str("NaN");
    } else if value.is_infinite() {
        buffer.push_str(if value > 0.0 { "+Inf" } else { "-Inf" });
    } else {
        let _ = write!(buffer, "{}", value);
    }
}

fn normalize_metric_name(name: &str, name_buf: &mut String) {
    name_buf.clear();

    for (i, c) in name.chars().enumerate() {
        if i == 0 && is_valid_name_start_char(c) || i != 0 && is_valid_name_char(c) {
            name_buf.push(c);
        } else {
            // Periods become a double underscore so they stay distinguishable from other separators.
            name_buf.push_str(if c == '.' { "__" } else { "_" });
        }
    }
}

#[inline]
fn is_valid_name_start_char(c: char) -> bool {
    // [a-zA-Z_:]
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[inline]
fn is_valid_name_char(c: char) -> bool {
    // [a-zA-Z0-9_:]
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
