//! Small helpers shared by the engine builder crates.

use bytesize::ByteSize;
use thousands::Separable;
use tracing::debug;

/// Human readable byte size, e.g. `8.0 GiB`.
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

/// Count with thousands separators, e.g. `25,000`.
pub fn format_count(count: usize) -> String {
    count.separate_with_commas()
}

/// Logs the current process memory footprint at debug level.
pub fn log_memory_usage(stage: &str) {
    match memory_stats::memory_stats() {
        Some(usage) => debug!(
            "memory after {stage}: physical={} virtual={}",
            format_bytes(usage.physical_mem as u64),
            format_bytes(usage.virtual_mem as u64)
        ),
        None => debug!("memory after {stage}: unavailable on this platform"),
    }
}
