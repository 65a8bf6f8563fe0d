use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the storage core. Every constructor that needs one takes
/// it explicitly; there is no global instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlfConfig {
    pub md_cache_capacity: usize,
    /// Worker pool size when verifying a fetched range of revisions.
    pub max_mds_at_a_time: usize,
    /// Revisions fetched per page while looking for the writer of a
    /// revision with copied writer metadata. Bounded by the server's
    /// response size limit.
    pub copied_writer_md_page_size: u64,
    pub revocation_allowance_secs: u64,
    pub max_retries_on_recoverable_errors: usize,
    pub fast_forward_rev_thresh: u64,
    pub fast_forward_time_thresh_secs: u64,
    pub flush_interval_ms: u64,
    pub cancellation_delay_ms: u64,
    pub max_parallel_block_puts: usize,
    /// Largest file a write or truncate may produce, in bytes.
    pub max_file_size: u64,
    pub cr_enabled: bool,
    /// How often the background reclaimer looks for blocks to delete.
    pub gc_period_secs: u64,
    /// How long a block must have been unreferenced before its
    /// references are deleted.
    pub gc_min_unref_age_secs: u64,
    /// Reclamation waits for a head written by another device to be
    /// this old, to stay out of the way of active writers.
    pub gc_min_head_age_secs: u64,
    pub journal_enabled: bool,
    pub journal_flush_batch: usize,
}

impl Default for TlfConfig {
    fn default() -> Self {
        Self {
            md_cache_capacity: 5000,
            max_mds_at_a_time: 10,
            copied_writer_md_page_size: 100,
            revocation_allowance_secs: 600,
            max_retries_on_recoverable_errors: 10,
            fast_forward_rev_thresh: 50,
            fast_forward_time_thresh_secs: 15 * 60,
            flush_interval_ms: 1000,
            cancellation_delay_ms: 1000,
            max_parallel_block_puts: 100,
            max_file_size: 64 << 20,
            cr_enabled: true,
            gc_period_secs: 60,
            gc_min_unref_age_secs: 60,
            gc_min_head_age_secs: 5 * 60,
            journal_enabled: false,
            journal_flush_batch: 64,
        }
    }
}

impl TlfConfig {
    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn revocation_allowance(&self) -> Duration {
        Duration::from_secs(self.revocation_allowance_secs)
    }

    pub fn fast_forward_time_thresh(&self) -> Duration {
        Duration::from_secs(self.fast_forward_time_thresh_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn cancellation_delay(&self) -> Duration {
        Duration::from_millis(self.cancellation_delay_ms)
    }

    pub fn gc_period(&self) -> Duration {
        Duration::from_secs(self.gc_period_secs)
    }

    pub fn gc_min_unref_age(&self) -> Duration {
        Duration::from_secs(self.gc_min_unref_age_secs)
    }

    pub fn gc_min_head_age(&self) -> Duration {
        Duration::from_secs(self.gc_min_head_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = TlfConfig::from_toml_str(
            r#"
            md_cache_capacity = 16
            journal_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.md_cache_capacity, 16);
        assert!(cfg.journal_enabled);
        assert_eq!(cfg.max_retries_on_recoverable_errors, 10);
        assert_eq!(cfg.fast_forward_time_thresh(), Duration::from_secs(900));
        assert_eq!(cfg.gc_min_head_age(), Duration::from_secs(300));
    }
}
