use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single named sample as it travels through the pipeline: a Unix
/// timestamp in whole seconds paired with a 64-bit float value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Datapoint {
    pub timestamp: i64,
    pub value: f64,
}

impl Datapoint {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Datapoint { timestamp, value }
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.value)
    }
}

impl From<(i64, f64)> for Datapoint {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Datapoint { timestamp, value }
    }
}

/// Current wall clock as whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
