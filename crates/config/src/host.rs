use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Host {
    /// File holding the Yama ptrace policy. The value is a single integer:
    /// 0 lets any process attach to any other process of the same user, 1
    /// restricts attach to ancestors and declared tracers, 2 requires
    /// CAP_SYS_PTRACE and 3 disables attach until reboot.
    ///
    /// See <https://www.kernel.org/doc/Documentation/security/Yama.txt>.
    pub ptrace_scope_path: PathBuf,

    /// The GNU debugger executable used to attach to targets. Looked up in
    /// `PATH` when not absolute.
    pub gdb_path: PathBuf,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            ptrace_scope_path: PathBuf::from("/proc/sys/kernel/yama/ptrace_scope"),
            gdb_path: PathBuf::from("gdb"),
        }
    }
}
