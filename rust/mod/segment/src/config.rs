use std::time::Duration;

use serde::Deserialize;

/// Tunables for the segment module, read from the `[segments]` table of
/// the server config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Maximum length, in characters, of a segment name.
    pub name_max_len: usize,

    /// Deadline for an ad-hoc subscriber count, in milliseconds (0 = none).
    pub count_timeout_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name_max_len: 200,
            count_timeout_ms: 5_000,
        }
    }
}

impl SegmentConfig {
    pub fn count_timeout(&self) -> Option<Duration> {
        (self.count_timeout_ms > 0).then(|| Duration::from_millis(self.count_timeout_ms))
    }
}
