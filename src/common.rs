use std::fmt;
use std::io;

use thiserror::Error;

/// Wire format tag for metric points.
pub const METRIC_FORMAT: &str = "wavefront";
/// Wire format tag for histogram distributions.
pub const HISTOGRAM_FORMAT: &str = "histogram";
/// Wire format tag for tracing spans.
pub const TRACING_SPAN_FORMAT: &str = "trace";
/// Wire format tag for span logs.
pub const SPAN_LOG_FORMAT: &str = "spanLogs";

/// The kinds of entities the sender buffers and delivers, each with its own queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Point,
    Histogram,
    Span,
    SpanLog,
}

impl EntityKind {
    /// All kinds, in the order a flush cycle visits them.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Point,
        EntityKind::Histogram,
        EntityKind::Span,
        EntityKind::SpanLog,
    ];

    /// The format tag handed to the transport.
    pub fn format(&self) -> &'static str {
        match self {
            Self::Point => METRIC_FORMAT,
            Self::Histogram => HISTOGRAM_FORMAT,
            Self::Span => TRACING_SPAN_FORMAT,
            Self::SpanLog => SPAN_LOG_FORMAT,
        }
    }

    /// Prefix used for the self-metrics of this kind.
    pub fn metric_prefix(&self) -> &'static str {
        match self {
            Self::Point => "points",
            Self::Histogram => "histograms",
            Self::Span => "spans",
            Self::SpanLog => "span_logs",
        }
    }

    /// Whether an authorization rejection latches this kind off for the life of the process.
    ///
    /// Metric points are never disabled: a 401/403 on points is treated as transient.
    pub fn can_be_disabled(&self) -> bool {
        !matches!(self, Self::Point)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Point => "points",
            Self::Histogram => "histograms",
            Self::Span => "spans",
            Self::SpanLog => "span logs",
        };
        f.write_str(name)
    }
}

/// Errors raised while encoding an entity into line data.
///
/// The message always carries the full input so that a rejected call can be traced back to
/// the code that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{entity} name cannot be blank: {context}")]
    BlankName {
        entity: &'static str,
        context: String,
    },

    #[error("{entity} source cannot be blank: {context}")]
    BlankSource {
        entity: &'static str,
        context: String,
    },

    #[error("{entity} tag key cannot be blank: {context}")]
    BlankTagKey {
        entity: &'static str,
        context: String,
    },

    #[error("{entity} tag value cannot be blank for {key}=[{value}]: {context}")]
    BlankTagValue {
        entity: &'static str,
        key: String,
        value: String,
        context: String,
    },

    #[error("histogram centroids cannot be empty: {context}")]
    EmptyCentroids { context: String },

    #[error("histogram granularities cannot be empty: {context}")]
    EmptyGranularities { context: String },

    #[error("point must be non-blank and in Wavefront data format")]
    BlankPoint,
}

/// Errors surfaced by a flush cycle.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to report {kind} to Wavefront: {source}")]
    Transport {
        kind: EntityKind,
        #[source]
        source: io::Error,
    },

    #[error("unable to serialize span logs to json: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that could occur while building or installing a Wavefront sender.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Creating the background runtime failed.
    #[error("failed to create Tokio runtime for exporter: {0}")]
    FailedToCreateRuntime(String),

    /// The direct ingestion endpoint was not a valid http(s) URL.
    #[error("direct ingestion server `{0}` must be an http:// or https:// URL")]
    InvalidServerUrl(String),

    /// A proxy was configured without any port to send to.
    #[error("proxy `{0}` must have at least one of the metrics, distribution or tracing ports set")]
    MissingProxyPort(String),

    /// The exporter destination was never configured.
    #[error("attempted to build exporter with no exporters enabled; did you configure a transport?")]
    MissingExporterConfiguration,

    /// A size or count setting was zero.
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    /// Failed to build the HTTP client used for direct ingestion.
    #[error("failed to create http client: {0}")]
    HttpClient(String),
}
