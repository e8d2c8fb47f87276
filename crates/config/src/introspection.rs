use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Introspection {
    /// Upper bound on how long the tool waits for the injected routine to
    /// return. **Measured in milliseconds**.
    ///
    /// ## Note
    ///
    /// This governs the tool's wait, not the target: a routine that is still
    /// walking the heap at the deadline is abandoned. The tool detaches and
    /// the routine finishes on its own inside the target.
    #[serde(rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    /// Maximum number of sample objects (string contents) recorded per type.
    /// Zero disables sampling.
    pub sample_limit: u32,

    /// Samples longer than this many characters are truncated.
    pub sample_max_len: u32,
}

impl Default for Introspection {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            sample_limit: 20,
            sample_max_len: 200,
        }
    }
}
