//! Client-side sync configuration.

use std::time::Duration;

/// Timing and sizing knobs shared by providers, the session cache and the
/// upload connector.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window during which local updates are merged into one row. Default: 300ms.
    pub throttle: Duration,
    /// Grace period before an unreferenced session is torn down. Default: 60s.
    pub cleanup_delay: Duration,
    /// Ids per delete statement during compaction. Default: 200.
    pub gc_delete_chunk: usize,
    /// Delay before a failed upload cycle is retried. Default: 5s.
    pub upload_retry_delay: Duration,
    /// Per-call timeout for remote RPCs. Default: 10s.
    pub rpc_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(300),
            cleanup_delay: Duration::from_secs(60),
            gc_delete_chunk: 200,
            upload_retry_delay: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Config for testing (short retry delay and timeouts, small chunks).
    pub fn for_testing() -> Self {
        Self {
            throttle: Duration::from_millis(300),
            cleanup_delay: Duration::from_secs(60),
            gc_delete_chunk: 2,
            upload_retry_delay: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(500),
        }
    }
}
