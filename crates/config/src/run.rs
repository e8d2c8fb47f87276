use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Run {
    /// Budget for a whole run: attach, introspection and writing the
    /// snapshot. Stage timeouts are clipped to whatever is left of it.
    /// **Measured in milliseconds**.
    #[serde(rename = "overall_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub overall_timeout: Duration,

    /// Extra time granted to detach from the target once a run is over,
    /// whether it succeeded or not. The debugger helper is killed when this
    /// runs out. **Measured in milliseconds**.
    #[serde(rename = "cleanup_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cleanup_grace: Duration,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(2),
        }
    }
}
