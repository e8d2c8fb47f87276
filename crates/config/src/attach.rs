use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Attach {
    /// How long to wait for the debugger to take control of the target.
    /// **Measured in milliseconds**.
    ///
    /// Attaching stops every thread of the target, so a slow attach usually
    /// means the target has a very large number of threads or mapped
    /// libraries.
    #[serde(rename = "timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    /// How often the target's liveness is re-checked while waiting on the
    /// debugger. Bounds how late a target death is noticed. **Measured in
    /// milliseconds**, never less than one.
    #[serde(rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for Attach {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}
