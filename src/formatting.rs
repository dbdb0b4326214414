#![allow(clippy::too_many_arguments)]
use std::fmt::Write;

use serde::Serialize;
use uuid::Uuid;

use crate::common::ValidationError;
use crate::entities::{Centroid, HistogramGranularity, SpanLog, Tags};

// "<METRIC_NAME>" <VALUE> [<TIMESTAMP>] source="<SOURCE>" ["<TAG_KEY>"="<TAG_VALUE>" ...]
// !M [<TIMESTAMP>] #<COUNT> <VALUE> ... "<NAME>" source="<SOURCE>" ["<TAG_KEY>"="<TAG_VALUE>" ...]
// "<SPAN_NAME>" source="<SOURCE>" traceId=<UUID> spanId=<UUID> [parent=<UUID> ...]
//     [followsFrom=<UUID> ...] ["<TAG_KEY>"="<TAG_VALUE>" ...] <START_MILLIS> <DURATION_MILLIS>
// {"traceId":"<UUID>","spanId":"<UUID>","logs":[{"timestamp":<MICROS>,"fields":{...}}],"span":...}

/// Tag added to a span line when span logs accompany it.
pub const SPAN_LOG_KEY: &str = "_spanLogs";

/// Sanitizes a metric name, source or tag key and wraps it in double quotes.
///
/// Everything other than ASCII alphanumerics, `-`, `.` and `_` becomes `-`. The first
/// character may also be `~` (internal metrics), `Δ` or `∆` (delta counters).
pub fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    push_sanitized(&mut out, s);
    out.push('"');
    out
}

/// Same as [`sanitize`], without the surrounding quotes.
pub fn sanitize_without_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    push_sanitized(&mut out, s);
    out
}

/// Quotes a free-form tag value: surrounding whitespace is trimmed, embedded quotes and
/// newlines are escaped, and everything else (spaces included) is kept.
pub fn sanitize_value(s: &str) -> String {
    let trimmed = s.trim();
    let mut out = String::with_capacity(trimmed.len() + 2);
    out.push('"');
    for c in trimmed.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn push_sanitized(out: &mut String, s: &str) {
    let mut is_valid: fn(char) -> bool = valid_first_character;
    for c in s.chars() {
        out.push(if is_valid(c) { c } else { '-' });
        is_valid = valid_character;
    }
}

#[inline]
fn valid_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'
}

#[inline]
fn valid_first_character(c: char) -> bool {
    valid_character(c) || c == '~' || c == '\u{0394}' || c == '\u{2206}'
}

#[inline]
fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Renders a double the way the backend expects it, always with a fractional part.
fn format_value(value: f64) -> String {
    format!("{:?}", value)
}

fn render_context<'a, I>(name: &str, source: Option<&str>, tags: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let tags = tags
        .into_iter()
        .map(|(k, v)| format!("{}=[{}]", k, v))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "name={}, source={}, tags={{{}}}",
        name,
        source.unwrap_or("null"),
        tags
    )
}

fn tag_pairs<'a>(tags: Option<&'a Tags>) -> impl Iterator<Item = (&'a str, &'a str)> {
    tags.into_iter()
        .flat_map(|t| t.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// Resolves the source to write, falling back to `default_source` when none is given.
fn resolve_source<'a>(source: Option<&'a str>, default_source: &'a str) -> &'a str {
    match source {
        Some(s) if !is_blank(s) => s,
        _ => default_source,
    }
}

fn write_tags<'a, I, C>(
    buffer: &mut String,
    entity: &'static str,
    tags: I,
    context: C,
) -> Result<(), ValidationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
    C: Fn() -> String,
{
    for (key, value) in tags {
        if is_blank(key) {
            return Err(ValidationError::BlankTagKey {
                entity,
                context: context(),
            });
        }
        if is_blank(value) {
            return Err(ValidationError::BlankTagValue {
                entity,
                key: key.to_string(),
                value: value.to_string(),
                context: context(),
            });
        }
        buffer.push(' ');
        buffer.push_str(&sanitize(key));
        buffer.push('=');
        buffer.push_str(&sanitize_value(value));
    }
    Ok(())
}

/// Encodes a metric point as a single line.
///
/// ```
/// # use metrics_exporter_wavefront::formatting::metric_to_line_data;
/// # use metrics_exporter_wavefront::Tags;
/// let mut tags = Tags::new();
/// tags.insert("datacenter".into(), "dc1".into());
/// let line = metric_to_line_data(
///     "new-york.power.usage", 42422.0, Some(1493773500), Some("localhost"), Some(&tags), "h",
/// ).unwrap();
/// assert_eq!(
///     line,
///     "\"new-york.power.usage\" 42422.0 1493773500 source=\"localhost\" \"datacenter\"=\"dc1\"\n"
/// );
/// ```
pub fn metric_to_line_data(
    name: &str,
    value: f64,
    timestamp: Option<i64>,
    source: Option<&str>,
    tags: Option<&Tags>,
    default_source: &str,
) -> Result<String, ValidationError> {
    let context = || render_context(name, source, tag_pairs(tags));
    if is_blank(name) {
        return Err(ValidationError::BlankName {
            entity: "metric",
            context: context(),
        });
    }
    let source = resolve_source(source, default_source);
    if is_blank(source) {
        return Err(ValidationError::BlankSource {
            entity: "metric",
            context: context(),
        });
    }

    let mut buffer = String::new();
    buffer.push_str(&sanitize(name));
    buffer.push(' ');
    buffer.push_str(&format_value(value));
    if let Some(ts) = timestamp {
        let _ = write!(buffer, " {}", ts);
    }
    buffer.push_str(" source=");
    buffer.push_str(&sanitize(source));
    write_tags(&mut buffer, "metric", tag_pairs(tags), context)?;
    buffer.push('\n');
    Ok(buffer)
}

/// Encodes a distribution as one line per requested granularity.
///
/// Lines are written minute, hour, day regardless of the order granularities are given in;
/// duplicates are collapsed.
pub fn histogram_to_line_data(
    name: &str,
    centroids: &[Centroid],
    granularities: &[HistogramGranularity],
    timestamp: Option<i64>,
    source: Option<&str>,
    tags: Option<&Tags>,
    default_source: &str,
) -> Result<String, ValidationError> {
    let context = || render_context(name, source, tag_pairs(tags));
    if is_blank(name) {
        return Err(ValidationError::BlankName {
            entity: "histogram",
            context: context(),
        });
    }
    let source = resolve_source(source, default_source);
    if is_blank(source) {
        return Err(ValidationError::BlankSource {
            entity: "histogram",
            context: context(),
        });
    }
    if centroids.is_empty() {
        return Err(ValidationError::EmptyCentroids { context: context() });
    }
    if granularities.is_empty() {
        return Err(ValidationError::EmptyGranularities { context: context() });
    }

    // Everything after the granularity marker is shared by all lines.
    let mut body = String::new();
    if let Some(ts) = timestamp {
        let _ = write!(body, " {}", ts);
    }
    for centroid in centroids {
        let _ = write!(
            body,
            " #{} {}",
            centroid.count,
            format_value(centroid.value)
        );
    }
    body.push(' ');
    body.push_str(&sanitize(name));
    body.push_str(" source=");
    body.push_str(&sanitize(source));
    write_tags(&mut body, "histogram", tag_pairs(tags), context)?;
    body.push('\n');

    let mut buffer = String::new();
    for granularity in HistogramGranularity::ALL
        .iter()
        .filter(|g| granularities.contains(g))
    {
        buffer.push_str(granularity.identifier());
        buffer.push_str(&body);
    }
    Ok(buffer)
}

/// Encodes a tracing span as a single line.
pub fn tracing_span_to_line_data<K, V>(
    name: &str,
    start_millis: i64,
    duration_millis: i64,
    source: Option<&str>,
    trace_id: Uuid,
    span_id: Uuid,
    parents: &[Uuid],
    follows_from: &[Uuid],
    tags: &[(K, V)],
    span_logs: &[SpanLog],
    default_source: &str,
) -> Result<String, ValidationError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let pairs = || tags.iter().map(|(k, v)| (k.as_ref(), v.as_ref()));
    let context = || render_context(name, source, pairs());
    if is_blank(name) {
        return Err(ValidationError::BlankName {
            entity: "span",
            context: context(),
        });
    }
    let source = resolve_source(source, default_source);
    if is_blank(source) {
        return Err(ValidationError::BlankSource {
            entity: "span",
            context: context(),
        });
    }

    let mut buffer = String::new();
    buffer.push_str(&sanitize_value(name));
    buffer.push_str(" source=");
    buffer.push_str(&sanitize(source));
    let _ = write!(buffer, " traceId={} spanId={}", trace_id, span_id);
    for parent in parents {
        let _ = write!(buffer, " parent={}", parent);
    }
    for follows in follows_from {
        let _ = write!(buffer, " followsFrom={}", follows);
    }
    write_tags(&mut buffer, "span", pairs(), context)?;
    if !span_logs.is_empty() {
        buffer.push(' ');
        buffer.push_str(&sanitize(SPAN_LOG_KEY));
        buffer.push('=');
        buffer.push_str(&sanitize_value("true"));
    }
    let _ = writeln!(buffer, " {} {}", start_millis, duration_millis);
    Ok(buffer)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanLogsRecord<'a> {
    trace_id: Uuid,
    span_id: Uuid,
    logs: &'a [SpanLog],
    span: Option<&'a str>,
}

/// Encodes the logs of one span as a JSON line, optionally carrying the span's own line.
pub fn span_logs_to_line_data(
    trace_id: Uuid,
    span_id: Uuid,
    span_logs: &[SpanLog],
    span: Option<&str>,
) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(&SpanLogsRecord {
        trace_id,
        span_id,
        logs: span_logs,
        span,
    })?;
    json.push('\n');
    Ok(json)
}
