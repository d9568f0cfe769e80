use serde::{Deserialize, Serialize};

/// Configuration recognized by the per-region core. Field defaults follow the
/// serving deployment; everything is overridable before the stores are built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Reject mutation batches larger than this.
    pub max_batch_count: usize,
    /// Reject requests whose payload exceeds this many bytes.
    pub max_request_size: usize,
    /// Cap on mutations in a single prewrite.
    pub max_prewrite_count: usize,
    /// Scans asking for more than this many rows are forced to stream.
    pub stream_message_max_limit_size: usize,
    /// How long an idle stream cursor survives, in milliseconds.
    pub stream_ttl_ms: u64,
    /// Dirty records accumulated by a flat index before it asks to be saved.
    pub flat_need_save_count: u64,
    /// Backpressure threshold for the background task queue.
    pub max_background_task_count: usize,
    /// Route document/vector search RPCs through the read pool.
    pub enable_async_search: bool,
    /// Route count RPCs through the read pool.
    pub enable_async_count: bool,
    /// Route write RPCs through the write pool.
    pub enable_async_operation: bool,
    /// Values at or below this many bytes ride inline in lock/write records.
    pub short_value_threshold: usize,
    /// Worker threads in the read pool.
    pub read_pool_size: usize,
    /// Worker threads in the write pool.
    pub write_pool_size: usize,
    /// Queue capacity per worker.
    pub worker_queue_size: usize,
    /// Records a GC pass handles between cooperative yields.
    pub gc_batch_keys: usize,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            max_batch_count: 4096,
            max_request_size: 32 * 1024 * 1024,
            max_prewrite_count: 1024,
            stream_message_max_limit_size: 1024,
            stream_ttl_ms: 60_000,
            flat_need_save_count: 10_000,
            max_background_task_count: 32,
            enable_async_search: true,
            enable_async_count: true,
            enable_async_operation: true,
            short_value_threshold: 255,
            read_pool_size: 4,
            write_pool_size: 2,
            worker_queue_size: 256,
            gc_batch_keys: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_batch_count, 4096);
        assert_eq!(config.max_request_size, 32 * 1024 * 1024);
        assert_eq!(config.max_prewrite_count, 1024);
        assert!(config.short_value_threshold <= 255);
    }
}
