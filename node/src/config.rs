//! Node configuration types and defaults.

use ember_peers_addrbook::{
    AddressBookConfig, PeerAddress, PeerSelector, DEFAULT_BACKOFF_OVERRIDE_AFTER,
    DEFAULT_DIAL_BACKOFF, DEFAULT_RETRY_BUDGET,
};
use std::fmt;
use std::time::Duration;

/// Default steady-state count of maintained outbound connections.
pub const DEFAULT_TARGET_OUTBOUND: usize = 8;
/// Default scheduler poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default average interval between feeler connections.
pub const DEFAULT_FEELER_AVERAGE_INTERVAL: Duration = Duration::from_secs(120);
/// Default interval between introducer polls.
pub const DEFAULT_INTRODUCER_POLL_INTERVAL: Duration = Duration::from_secs(300);
/// Default grace given to background tasks during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Default failed-attempt count before an address becomes removable.
pub const DEFAULT_STALE_FAILURE_THRESHOLD: u32 = 10;
/// Default age of the last success past which the failure threshold
/// applies.
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration of the connection scheduling layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Desired number of long-lived outbound connections.
    pub target_outbound_connections: usize,
    /// Scheduler poll interval.
    pub poll_interval: Duration,
    /// Average interval of the Poisson feeler process.
    pub feeler_average_interval: Duration,
    /// Bootstrap peer serving address lists, if any.
    pub introducer: Option<PeerAddress>,
    /// Interval between introducer polls.
    pub introducer_poll_interval: Duration,
    /// Recency window inside which a candidate is not redialed.
    pub dial_backoff: Duration,
    /// Candidate draws per scheduling decision.
    pub candidate_retry_budget: u32,
    /// Rejections after which the recency backoff is ignored.
    pub backoff_override_after: u32,
    /// Failed attempts before an address becomes removable.
    pub stale_failure_threshold: u32,
    /// Age of the last success past which the failure threshold applies.
    pub stale_age: Duration,
    /// Grace given to background tasks during shutdown before aborting.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_outbound_connections: DEFAULT_TARGET_OUTBOUND,
            poll_interval: DEFAULT_POLL_INTERVAL,
            feeler_average_interval: DEFAULT_FEELER_AVERAGE_INTERVAL,
            introducer: None,
            introducer_poll_interval: DEFAULT_INTRODUCER_POLL_INTERVAL,
            dial_backoff: DEFAULT_DIAL_BACKOFF,
            candidate_retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_override_after: DEFAULT_BACKOFF_OVERRIDE_AFTER,
            stale_failure_threshold: DEFAULT_STALE_FAILURE_THRESHOLD,
            stale_age: DEFAULT_STALE_AGE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl Config {
    /// Configuration with all defaults.
    pub fn new() -> Self {
        Config::default()
    }

    /// Set the outbound connection target.
    pub fn with_target_outbound(mut self, target: usize) -> Self {
        self.target_outbound_connections = target;
        self
    }

    /// Set the scheduler poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the average feeler interval.
    pub fn with_feeler_average_interval(mut self, interval: Duration) -> Self {
        self.feeler_average_interval = interval;
        self
    }

    /// Configure the introducer peer and its poll interval.
    pub fn with_introducer(mut self, introducer: PeerAddress, poll_interval: Duration) -> Self {
        self.introducer = Some(introducer);
        self.introducer_poll_interval = poll_interval;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Candidate selection policy derived from this configuration.
    pub fn selector(&self) -> PeerSelector {
        PeerSelector::new()
            .with_dial_backoff(self.dial_backoff)
            .with_retry_budget(self.candidate_retry_budget)
            .with_backoff_override_after(self.backoff_override_after)
    }

    /// Address book tunables derived from this configuration.
    pub fn book_config(&self) -> AddressBookConfig {
        AddressBookConfig {
            stale_failure_threshold: self.stale_failure_threshold,
            stale_age_secs: self.stale_age.as_secs(),
            ..AddressBookConfig::default()
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let introducer = match &self.introducer {
            Some(peer) => peer.to_string(),
            None => "none".to_string(),
        };
        write!(
            f,
            "Config {{ target_outbound: {}, poll: {:?}, feeler_avg: {:?}, introducer: {introducer}, backoff: {:?} }}",
            self.target_outbound_connections,
            self.poll_interval,
            self.feeler_average_interval,
            self.dial_backoff,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.target_outbound_connections, 8);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.feeler_average_interval, Duration::from_secs(120));
        assert_eq!(config.dial_backoff, Duration::from_secs(600));
        assert_eq!(config.candidate_retry_budget, 100);
        assert_eq!(config.backoff_override_after, 30);
        assert!(config.introducer.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let introducer = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 9444);
        let config = Config::new()
            .with_target_outbound(2)
            .with_poll_interval(Duration::from_millis(50))
            .with_introducer(introducer.clone(), Duration::from_secs(30));
        assert_eq!(config.target_outbound_connections, 2);
        assert_eq!(config.introducer, Some(introducer));
        assert_eq!(config.introducer_poll_interval, Duration::from_secs(30));
    }
}
