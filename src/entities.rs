use indexmap::IndexMap;
use serde::Serialize;

/// Point and histogram tags, in the order they are written to the line.
pub type Tags = IndexMap<String, String>;

/// The aggregation interval of a histogram distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistogramGranularity {
    Minute,
    Hour,
    Day,
}

impl HistogramGranularity {
    pub const ALL: [HistogramGranularity; 3] = [
        HistogramGranularity::Minute,
        HistogramGranularity::Hour,
        HistogramGranularity::Day,
    ];

    /// The marker that opens a histogram line, e.g. `!M`.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::Minute => "!M",
            Self::Hour => "!H",
            Self::Day => "!D",
        }
    }
}

/// A single `(value, count)` pair of a distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid {
    pub value: f64,
    pub count: u32,
}

impl Centroid {
    pub fn new(value: f64, count: u32) -> Self {
        Self { value, count }
    }
}

impl From<(f64, u32)> for Centroid {
    fn from((value, count): (f64, u32)) -> Self {
        Self { value, count }
    }
}

/// A timestamped set of fields attached to a span.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpanLog {
    /// Microseconds since the epoch.
    pub timestamp: i64,
    pub fields: IndexMap<String, String>,
}

impl SpanLog {
    pub fn new(timestamp: i64, fields: IndexMap<String, String>) -> Self {
        Self { timestamp, fields }
    }
}
