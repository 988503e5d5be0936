use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = i64;

/// Sample value type.
pub type Value = f64;

/// A metric: a set of labels with unique names. The reserved label
/// [`METRIC_NAME_LABEL`] carries the metric name.
pub type Metric = HashMap<String, String>;

/// The reserved label name under which the metric name is stored.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single timestamped value within a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePair {
    pub timestamp: Timestamp,
    pub value: Value,
}

/// A sample as submitted by producers: a metric plus one timestamped value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: Metric,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// A closed time interval. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub oldest_inclusive: Timestamp,
    pub newest_inclusive: Timestamp,
}

/// Stable 64-bit identifier of a metric, derived from the canonical
/// (name-sorted) label encoding. The derivation is fixed for the lifetime of
/// a storage directory; colliding metrics are treated as the same series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

const FINGERPRINT_SEED: u64 = 0;
const LABEL_SEP: u8 = 0xff;

impl Fingerprint {
    /// Derives the fingerprint of a metric. Labels are hashed sorted by name
    /// with a separator byte that cannot occur in UTF-8 label data.
    pub fn from_metric(metric: &Metric) -> Fingerprint {
        let mut names: Vec<&String> = metric.keys().collect();
        names.sort();

        let mut hasher = XxHash64::with_seed(FINGERPRINT_SEED);
        for name in names {
            hasher.write(name.as_bytes());
            hasher.write(&[LABEL_SEP]);
            hasher.write(metric[name].as_bytes());
            hasher.write(&[LABEL_SEP]);
        }
        Fingerprint(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Returns whether `name` is acceptable as a label name: a non-empty
/// identifier of ASCII letters, digits and underscores, not starting with a
/// digit.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
