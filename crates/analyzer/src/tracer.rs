//! Cooperative opt-in for processes that want to be inspectable.
//!
//! Under `ptrace_scope = 1` only ancestors and explicitly declared tracers
//! may attach. A long-running service that wants to be analysable calls
//! [`allow_any_tracer`] once during startup.

use crate::error::PlatformError;

/// Declare that any process may ptrace the caller.
///
/// The declaration holds for the rest of the calling process's lifetime and
/// cannot be revoked short of declaring a different tracer. Calling it again
/// is a successful no-op. Failure is not fatal to anything: the process may
/// already be traceable under the host policy alone.
#[cfg(target_os = "linux")]
pub fn allow_any_tracer() -> Result<(), PlatformError> {
    #[allow(unsafe_code)]
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_PTRACER,
            libc::PR_SET_PTRACER_ANY,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    nix::errno::Errno::result(ret)?;
    tracing::debug!(pid = std::process::id(), "any process may now trace us");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn allow_any_tracer() -> Result<(), PlatformError> {
    Err(PlatformError::Unsupported)
}
