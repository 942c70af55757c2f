use std::time::Duration;

/// How transient driver failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Entries held per subscription before the oldest is evicted.
    pub notification_capacity: usize,
    /// Alive connections, counting attempts still in flight.
    pub max_connections: usize,
    /// Scans that have not yet stopped.
    pub max_scans: usize,
    pub max_subscriptions_per_connection: usize,
    pub retry: RetryPolicy,
    /// Budget for disconnecting every alive link at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 256,
            max_connections: 3,
            max_scans: 5,
            max_subscriptions_per_connection: 10,
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
