// Quality-of-service limits for inbound handler dispatch.
use std::thread;

const DEFAULT_MEMORY_ALLOWANCE: usize = 64 * 1024 * 1024;

fn default_worker_count() -> usize {
    4 * thread::available_parallelism().map_or(1, |count| count.get())
}

/// Resource limits applied to a registered service's inbound traffic.
#[derive(Debug, Clone, Copy)]
pub struct ServiceLimits {
    /// Concurrent broadcast handlers.
    pub broadcast_workers: usize,
    /// Memory allowance for pending broadcasts, in bytes.
    pub broadcast_memory: usize,
    /// Concurrent request handlers.
    pub request_workers: usize,
    /// Memory allowance for pending requests, in bytes.
    pub request_memory: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        let workers = default_worker_count();
        Self {
            broadcast_workers: workers,
            broadcast_memory: DEFAULT_MEMORY_ALLOWANCE,
            request_workers: workers,
            request_memory: DEFAULT_MEMORY_ALLOWANCE,
        }
    }
}

/// Resource limits applied to a single topic subscription.
#[derive(Debug, Clone, Copy)]
pub struct TopicLimits {
    /// Concurrent event handlers for the topic.
    pub event_workers: usize,
    /// Memory allowance for pending events, in bytes.
    pub event_memory: usize,
}

impl Default for TopicLimits {
    fn default() -> Self {
        Self {
            event_workers: default_worker_count(),
            event_memory: DEFAULT_MEMORY_ALLOWANCE,
        }
    }
}
