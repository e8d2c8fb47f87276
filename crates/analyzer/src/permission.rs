#![forbid(unsafe_code)]

//! Pre-flight check of the host's Yama ptrace policy.
//!
//! The check is advisory: a passing gate does not guarantee the attach will
//! succeed (the policy may change, or the target may belong to another
//! user), but a failing gate saves a doomed attach and tells the operator
//! what to change.

use crate::error::PermissionError;
use config::Config;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What the host policy lets us do, when it lets us do anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLevel {
    /// No Yama module. Classic ptrace rules apply (same uid, or CAP_SYS_PTRACE).
    Absent,
    /// `ptrace_scope = 0`.
    Unrestricted,
    /// `ptrace_scope = 1`: the target must name us (or any process) as its
    /// tracer, or we must be one of its ancestors.
    DeclaredTracersOnly,
}

#[derive(Debug, Clone)]
pub struct PermissionGate {
    policy_path: PathBuf,
}

impl PermissionGate {
    pub fn new(policy_path: impl Into<PathBuf>) -> Self {
        Self {
            policy_path: policy_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.host.ptrace_scope_path)
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    /// Read the policy and decide whether attaching to a peer is possible.
    pub fn check_attach_allowed(&self) -> Result<PolicyLevel, PermissionError> {
        let raw = match std::fs::read_to_string(&self.policy_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.policy_path.display(), "no yama policy file");
                return Ok(PolicyLevel::Absent);
            }
            Err(source) => {
                return Err(PermissionError::Unreadable {
                    path: self.policy_path.clone(),
                    source,
                });
            }
        };

        let value = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| PermissionError::Malformed {
                path: self.policy_path.clone(),
                raw: raw.trim().to_owned(),
            })?;

        let level = classify(value)?;
        if level == PolicyLevel::DeclaredTracersOnly {
            warn!(
                policy_value = value,
                "ptrace is restricted to declared tracers; the target must opt in with PR_SET_PTRACER"
            );
        } else {
            debug!(policy_value = value, "ptrace policy permits attach");
        }
        Ok(level)
    }
}

fn classify(value: u32) -> Result<PolicyLevel, PermissionError> {
    match value {
        0 => Ok(PolicyLevel::Unrestricted),
        1 => Ok(PolicyLevel::DeclaredTracersOnly),
        2 => Err(PermissionError::Forbidden {
            policy_value: value,
            hint: "only processes with CAP_SYS_PTRACE may attach; run as root or lower \
                   kernel.yama.ptrace_scope to 1",
        }),
        _ => Err(PermissionError::Forbidden {
            policy_value: value,
            hint: "attach is disabled system-wide until the next reboot",
        }),
    }
}
