//! Memory diagnostics and best-effort cleanup around external inference calls.
//!
//! Inference sessions allocate large transient buffers; after each sub-batch
//! (and on any failure) we trim the allocator and log usage so regressions
//! show up in the host log rather than as silent OOMs.

use anyhow::Result;
use sysinfo::System;
use tracing::{debug, trace};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryStats {
    /// Resident set size of this process, if the platform reports it.
    pub process_rss: Option<u64>,
    pub system_used: u64,
    pub system_total: u64,
}

impl MemoryStats {
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let process_rss = sysinfo::get_current_pid().ok().and_then(|pid| {
            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| p.memory())
        });

        Self {
            process_rss,
            system_used: sys.used_memory(),
            system_total: sys.total_memory(),
        }
    }

    pub fn process_rss_gib(&self) -> Option<f64> {
        self.process_rss.map(|b| b as f64 / GIB)
    }
}

/// Emit current memory usage at debug level, tagged with the pipeline stage.
pub fn log_memory_stats(stage: &str) {
    let stats = MemoryStats::collect();
    debug!(
        stage,
        rss_gib = stats.process_rss_gib(),
        used_gib = stats.system_used as f64 / GIB,
        total_gib = stats.system_total as f64 / GIB,
        "Memory usage"
    );
}

/// Best-effort release of allocator caches. Never fails; failures here must
/// not mask the error that triggered the cleanup.
pub fn release_memory() {
    // malloc_trim is a glibc extension; other allocators get no trim call.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // Returns freed-memory state info we don't act on.
        unsafe {
            libc::malloc_trim(0);
        }
    }
    trace!("Released allocator caches");
}

/// Run `f`, and on failure attempt cleanup before re-returning the original
/// error unchanged.
pub fn with_cleanup<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match f() {
        Ok(value) => Ok(value),
        Err(err) => {
            release_memory();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    #[test]
    fn test_collect_reports_system_totals() {
        let stats = MemoryStats::collect();
        assert!(stats.system_total > 0);
        assert!(stats.system_used <= stats.system_total);
    }

    #[test]
    fn test_with_cleanup_passes_through_ok() {
        let result = with_cleanup(|| Ok(41 + 1)).unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_with_cleanup_preserves_original_error() {
        let err = with_cleanup::<()>(|| bail!("inference exploded")).unwrap_err();
        assert_eq!(err.to_string(), "inference exploded");
    }

    #[test]
    fn test_release_memory_is_infallible() {
        release_memory();
        release_memory();
    }
}
