//! Bridge configuration.
//!
//! Every tunable the core recognizes lives here, with the defaults the
//! bridge ships with. Environment parsing belongs to the binary wrapper;
//! the core only ever sees a fully built [`BridgeConfig`].

use std::time::Duration;

/// Lower bound on the observability log ring.
pub const LOG_BUFFER_MIN: usize = 100;
/// Upper bound on the observability log ring.
pub const LOG_BUFFER_MAX: usize = 1_000_000;

/// Configuration for the bridge core.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Interface the WebSocket listener binds to.
    pub ws_host: String,
    /// Port the WebSocket listener binds to.
    pub ws_port: u16,
    /// Port reserved for the observability HTTP collaborator.
    pub observability_port: u16,
    /// How long a session retains its transport after the last WebSocket
    /// detaches, so a page reload can reclaim it.
    pub grace_period: Duration,
    /// Maximum interval between outbound writes before a session is
    /// considered dead.
    pub idle_timeout: Duration,
    /// Overall BLE scan deadline during connect.
    pub scan_timeout: Duration,
    /// Deadline for the upgrade handshake (including the first RPC frame
    /// in RPC mode).
    pub handshake_timeout: Duration,
    /// Maximum writes queued per session before new writes are rejected.
    pub write_queue_depth: usize,
    /// Maximum retries for a write that failed with a transient error.
    pub max_write_retries: usize,
    /// Back-off schedule applied between write retries.
    pub retry_backoff: Vec<Duration>,
    /// Period of the stale/zombie sweeper.
    pub sweep_interval: Duration,
    /// Idle threshold after which a never-connected session holding a
    /// transport is swept as a zombie.
    pub zombie_threshold: Duration,
    /// Extra margin on top of `idle_timeout` before a session with no
    /// WebSockets and no grace timer is swept as stale.
    pub stale_margin: Duration,
    /// Capacity of the observability log ring, clamped to
    /// [`LOG_BUFFER_MIN`]..=[`LOG_BUFFER_MAX`].
    pub log_buffer_size: usize,
    /// Shared secret required for `admin_cleanup` messages. `None`
    /// disables the admin surface entirely.
    pub admin_token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            ws_host: "127.0.0.1".to_string(),
            ws_port: 8080,
            observability_port: 8081,
            grace_period: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            scan_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            write_queue_depth: 5,
            max_write_retries: 3,
            retry_backoff: vec![
                Duration::from_millis(500),
                Duration::from_millis(1500),
                Duration::from_millis(5000),
            ],
            sweep_interval: Duration::from_secs(30),
            zombie_threshold: Duration::from_secs(30),
            stale_margin: Duration::from_secs(60),
            log_buffer_size: 10_000,
            admin_token: None,
        }
    }
}

impl BridgeConfig {
    /// The configured log ring capacity, clamped to the supported range.
    pub fn clamped_log_buffer_size(&self) -> usize {
        self.log_buffer_size.clamp(LOG_BUFFER_MIN, LOG_BUFFER_MAX)
    }

    /// Back-off before retry `attempt` (zero-based). Attempts past the end
    /// of the schedule reuse its last entry.
    pub fn backoff_for_attempt(&self, attempt: usize) -> Duration {
        self.retry_backoff
            .get(attempt)
            .or_else(|| self.retry_backoff.last())
            .copied()
            .unwrap_or(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.grace_period, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.scan_timeout, Duration::from_secs(15));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.write_queue_depth, 5);
        assert_eq!(config.max_write_retries, 3);
        assert_eq!(
            config.retry_backoff,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1500),
                Duration::from_millis(5000)
            ]
        );
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.log_buffer_size, 10_000);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn log_buffer_size_is_clamped() {
        let mut config = BridgeConfig::default();
        config.log_buffer_size = 1;
        assert_eq!(config.clamped_log_buffer_size(), LOG_BUFFER_MIN);
        config.log_buffer_size = 10_000_000;
        assert_eq!(config.clamped_log_buffer_size(), LOG_BUFFER_MAX);
        config.log_buffer_size = 5_000;
        assert_eq!(config.clamped_log_buffer_size(), 5_000);
    }

    #[test]
    fn backoff_schedule_saturates_at_last_entry() {
        let config = BridgeConfig::default();
        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(5000));
        assert_eq!(config.backoff_for_attempt(9), Duration::from_millis(5000));
    }
}
