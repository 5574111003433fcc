use std::time::Duration;

/// Connection tuning shared by producers and consumers.
///
/// Defaults follow the stock NSQ client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub dial_timeout: Duration,
    /// Upper bound on waiting for a frame. Must exceed `heartbeat_interval`.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How often consumers re-query nsqlookupd. Must be non-zero.
    pub lookupd_poll_interval: Duration,
    /// RDY count sent to every nsqd connection.
    pub max_in_flight: u64,
    /// Deliveries after which a failing message is finished and dropped.
    /// Zero disables the limit.
    pub max_attempts: u16,
    /// Base requeue delay, multiplied by the attempt count.
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
    pub http_timeout: Duration,
    /// Bound on each `stop()`.
    pub shutdown_timeout: Duration,
    pub user_agent: String,
}

impl TransportConfig {
    /// Requeue delay for a message that failed on its `attempts`-th delivery.
    pub fn requeue_delay(&self, attempts: u16) -> Duration {
        self.default_requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(self.max_requeue_delay)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            lookupd_poll_interval: Duration::from_secs(60),
            max_in_flight: 1,
            max_attempts: 5,
            default_requeue_delay: Duration::from_secs(90),
            max_requeue_delay: Duration::from_secs(15 * 60),
            http_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            user_agent: format!("nsqlink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
