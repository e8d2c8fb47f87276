#![forbid(unsafe_code)]

//! The persisted result of a run.
//!
//! On disk a snapshot is a fixed header followed by an rkyv payload:
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 8    | magic `MASNAP\0\0`                 |
//! | 8      | 4    | schema version, little endian      |
//! | 12     | 8    | payload length, little endian      |
//! | 20     | n    | rkyv-archived [`Snapshot`]         |
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader sees either nothing or a complete file.

use crate::driver::StructuredOutput;
use crate::error::SnapshotError;
use rkyv::util::AlignedVec;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

const MAGIC: [u8; 8] = *b"MASNAP\0\0";
const HEADER_LEN: usize = 20;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub struct TypeStats {
    pub count: u64,
    /// Sum of the shallow sizes reported by the runtime.
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Snapshot {
    schema_version: u32,
    target_id: i32,
    target_name: String,
    capture_timestamp_ms: u64,
    object_type_breakdown: BTreeMap<String, TypeStats>,
    samples: BTreeMap<String, Vec<String>>,
}

impl Snapshot {
    pub fn new(
        target_id: i32,
        target_name: impl Into<String>,
        captured_at: SystemTime,
        output: StructuredOutput,
    ) -> Self {
        let capture_timestamp_ms = captured_at
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_millis() as u64)
            .unwrap_or_default();
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            target_id,
            target_name: target_name.into(),
            capture_timestamp_ms,
            object_type_breakdown: output.types,
            samples: output.samples,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn target_id(&self) -> i32 {
        self.target_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn capture_timestamp_ms(&self) -> u64 {
        self.capture_timestamp_ms
    }

    pub fn captured_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.capture_timestamp_ms)
    }

    pub fn object_type_breakdown(&self) -> &BTreeMap<String, TypeStats> {
        &self.object_type_breakdown
    }

    pub fn samples(&self) -> &BTreeMap<String, Vec<String>> {
        &self.samples
    }

    pub fn object_count(&self) -> u64 {
        self.object_type_breakdown.values().map(|s| s.count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.object_type_breakdown
            .values()
            .map(|s| s.total_bytes)
            .sum()
    }

    /// The `n` types holding the most bytes, largest first.
    pub fn largest_types(&self, n: usize) -> Vec<(&str, TypeStats)> {
        let mut types: Vec<_> = self
            .object_type_breakdown
            .iter()
            .map(|(name, stats)| (name.as_str(), *stats))
            .collect();
        types.sort_by(|a, b| b.1.total_bytes.cmp(&a.1.total_bytes).then(a.0.cmp(b.0)));
        types.truncate(n);
        types
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let payload = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|err| SnapshotError::Encode(err.to_string()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&self.schema_version.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < MAGIC.len() || bytes[..MAGIC.len()] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::Truncated {
                expected: HEADER_LEN as u64,
                actual: bytes.len() as u64,
            });
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(version);
        if version != SNAPSHOT_SCHEMA_VERSION {
            return Err(SnapshotError::UnsupportedSchema { found: version });
        }
        let mut declared = [0u8; 8];
        declared.copy_from_slice(&bytes[12..HEADER_LEN]);
        let declared = u64::from_le_bytes(declared);
        let payload = &bytes[HEADER_LEN..];
        if payload.len() as u64 != declared {
            return Err(SnapshotError::Truncated {
                expected: declared,
                actual: payload.len() as u64,
            });
        }

        // rkyv wants its input aligned; a plain Vec<u8> slice is not.
        let mut aligned = AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        let snapshot = rkyv::from_bytes::<Snapshot, rkyv::rancor::Error>(&aligned)
            .map_err(|err| SnapshotError::Decode(err.to_string()))?;
        if snapshot.schema_version != version {
            return Err(SnapshotError::Decode(format!(
                "payload schema {} does not match header schema {version}",
                snapshot.schema_version
            )));
        }
        Ok(snapshot)
    }
}

/// Where a write stands relative to the caller that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    Pending,
    Committed,
    /// The caller timed out; the write must not land.
    Abandoned,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotWriter;

impl SnapshotWriter {
    pub fn new() -> Self {
        Self
    }

    /// Atomically write `snapshot` to `path`, waiting at most `timeout`.
    ///
    /// On any failure, including the timeout, `path` is left exactly as it
    /// was before the call.
    pub async fn write(
        &self,
        path: &Path,
        snapshot: &Snapshot,
        timeout: Duration,
    ) -> Result<(), SnapshotError> {
        let bytes = snapshot.encode()?;
        let len = bytes.len();
        let commit = Arc::new(Mutex::new(Commit::Pending));
        // Dropping this future, e.g. on cancellation, abandons the write too.
        let _abandon = AbandonOnDrop(Arc::clone(&commit));
        let task = tokio::task::spawn_blocking({
            let path = path.to_owned();
            let commit = Arc::clone(&commit);
            move || persist(&path, &bytes, &commit, |file, bytes| file.write_all(bytes))
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => {
                if result.is_ok() {
                    debug!(path = %path.display(), bytes = len, "snapshot written");
                }
                result
            }
            Ok(Err(join)) => Err(SnapshotError::Io(io::Error::other(join))),
            Err(_) => {
                if abandon(&commit) == Commit::Committed {
                    return Ok(());
                }
                warn!(path = %path.display(), ?timeout, "snapshot write timed out");
                Err(SnapshotError::Timeout { after: timeout })
            }
        }
    }
}

struct AbandonOnDrop(Arc<Mutex<Commit>>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if abandon(&self.0) == Commit::Abandoned {
            debug!("snapshot write abandoned");
        }
    }
}

/// Stop a pending write from landing. A write that already committed stays.
fn abandon(commit: &Mutex<Commit>) -> Commit {
    let mut state = lock(commit);
    if *state == Commit::Pending {
        *state = Commit::Abandoned;
    }
    *state
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotReader;

impl SnapshotReader {
    pub fn read(path: &Path) -> Result<Snapshot, SnapshotError> {
        Snapshot::decode(&std::fs::read(path)?)
    }
}

fn lock(commit: &Mutex<Commit>) -> MutexGuard<'_, Commit> {
    commit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write through a temporary sibling of `path`, then rename it into place
/// unless the caller has abandoned the write.
fn persist<F>(path: &Path, bytes: &[u8], commit: &Mutex<Commit>, write: F) -> Result<(), SnapshotError>
where
    F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
{
    let dir: PathBuf = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => PathBuf::from("."),
    };
    let mut partial = tempfile::Builder::new()
        .prefix(".memory-analyzer-")
        .suffix(".partial")
        .tempfile_in(&dir)?;
    write(partial.as_file_mut(), bytes)?;
    partial.as_file().sync_all()?;

    let mut state = lock(commit);
    if *state == Commit::Abandoned {
        return Err(SnapshotError::Timeout {
            after: Duration::ZERO,
        });
    }
    partial
        .persist(path)
        .map_err(|err| SnapshotError::Io(err.error))?;
    *state = Commit::Committed;
    Ok(())
}
