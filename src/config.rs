use crate::ingest::retry::RetryConfig;
use crate::query::executor::PageLimits;
use crate::storage::search::SearchOptions;
use std::time::Duration;

/// Runtime configuration for a [`crate::LiveIndex`].
#[derive(Debug, Clone)]
pub struct LiveIndexConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Outbound messages buffered per connection before its sessions are
    /// closed as slow consumers.
    pub session_channel_capacity: usize,
    /// Rows per snapshot batch requested from the source.
    pub snapshot_batch_size: usize,
    /// Write a checkpoint after this many applied transactions; 0 disables
    /// cadence checkpoints.
    pub checkpoint_every_transactions: u64,
    /// Transactions touching more rows than this recompute affected session
    /// windows instead of maintaining them incrementally.
    pub max_incremental_changes: usize,
    /// Candidate session count at which reactions fan out over rayon.
    pub parallel_session_threshold: usize,
    /// How long [`crate::LiveIndex::shutdown`] waits for each reader.
    pub shutdown_timeout: Duration,
    pub search: SearchOptions,
    pub retry: RetryConfig,
}

impl Default for LiveIndexConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 1_000,
            session_channel_capacity: 1_024,
            snapshot_batch_size: 1_000,
            checkpoint_every_transactions: 1_000,
            max_incremental_changes: 256,
            parallel_session_threshold: 64,
            shutdown_timeout: Duration::from_secs(5),
            search: SearchOptions::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl LiveIndexConfig {
    /// Small batches, frequent checkpoints and quick retries; suited to tests
    /// and local runs.
    pub fn development() -> Self {
        Self {
            snapshot_batch_size: 100,
            checkpoint_every_transactions: 10,
            retry: RetryConfig::builder()
                .retry_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(200))
                .build(),
            shutdown_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Tuned for delta latency: sessions fan out earlier, large transactions
    /// fall back to recompute sooner, and checkpoints are rarer.
    pub fn low_latency() -> Self {
        Self {
            max_incremental_changes: 64,
            parallel_session_threshold: 16,
            checkpoint_every_transactions: 10_000,
            session_channel_capacity: 4_096,
            ..Self::default()
        }
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LiveIndexConfig;

    #[test]
    fn profiles_override_defaults() {
        let base = LiveIndexConfig::default();
        let dev = LiveIndexConfig::development();
        let fast = LiveIndexConfig::low_latency();
        assert_eq!(base.page_limits().default_page_size, 50);
        assert!(dev.checkpoint_every_transactions < base.checkpoint_every_transactions);
        assert!(fast.max_incremental_changes < base.max_incremental_changes);
        assert_eq!(fast.max_page_size, base.max_page_size);
    }
}
