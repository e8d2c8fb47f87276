#![forbid(unsafe_code)]

//! One-line human summaries of runs and snapshots.

use analyzer::{RunResult, Snapshot};
use std::path::Path;

pub fn run_line(pid: i32, output: &Path, result: &RunResult) -> String {
    match (&result.snapshot, &result.message) {
        (Some(snapshot), _) => format!(
            "pid {pid} ({}): {} -> {}",
            snapshot.target_name(),
            totals(snapshot),
            output.display()
        ),
        (None, Some(message)) => format!("pid {pid}: {}: {message}", result.status),
        (None, None) => format!("pid {pid}: {}", result.status),
    }
}

pub fn snapshot_line(path: &Path, snapshot: &Snapshot) -> String {
    format!(
        "{}: schema {}, pid {} ({}), captured at {} ms, {}",
        path.display(),
        snapshot.schema_version(),
        snapshot.target_id(),
        snapshot.target_name(),
        snapshot.capture_timestamp_ms(),
        totals(snapshot)
    )
}

/// The `top` types holding the most memory, one per line.
pub fn largest_types(snapshot: &Snapshot, top: usize) -> Vec<String> {
    snapshot
        .largest_types(top)
        .into_iter()
        .map(|(name, stats)| {
            format!(
                "  {:>10}  {:>9}  {name}",
                human_bytes(stats.total_bytes),
                stats.count
            )
        })
        .collect()
}

fn totals(snapshot: &Snapshot) -> String {
    format!(
        "{} objects, {} across {} types",
        snapshot.object_count(),
        human_bytes(snapshot.total_bytes()),
        snapshot.object_type_breakdown().len()
    )
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
