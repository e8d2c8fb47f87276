#![deny(unsafe_code)]

//! Attach to a live process, run an introspection routine inside it and
//! persist the structured result as a snapshot.
//!
//! The pieces compose in one direction only: [`RunController`] checks the
//! host with a [`PermissionGate`], opens an [`AttachSession`] over a
//! [`DebugBackend`], hands it to an [`IntrospectionDriver`] and stores the
//! outcome through a [`SnapshotWriter`]. Targets that want to be inspectable
//! under a restrictive host policy call [`allow_any_tracer`] themselves.

pub mod backend;
pub mod controller;
pub mod driver;
mod error;
pub mod permission;
pub mod session;
pub mod snapshot;
pub mod target;
mod tracer;

pub use backend::{BackendFactory, DebugBackend, GdbBackend, GdbFactory};
pub use controller::{Clock, RunController, RunResult, RunStatus, Services, SystemClock};
pub use driver::{
    IntrospectionDriver, IntrospectionRequest, OutputSchema, PythonDriver, StructuredOutput,
};
pub use error::{
    AttachError, BackendError, DetachError, ExecutionError, PermissionError, PlatformError,
    RunError, SnapshotError,
};
pub use permission::{PermissionGate, PolicyLevel};
pub use session::{AttachSession, SessionState};
pub use snapshot::{SNAPSHOT_SCHEMA_VERSION, Snapshot, SnapshotReader, SnapshotWriter, TypeStats};
pub use target::{Liveness, TargetProcess};
pub use tracer::allow_any_tracer;
