//! Subscription lease timing.

use std::time::Duration;

use rand::Rng;

use crate::error::{EventError, EventResult};

/// Lease requested when the caller does not pick one.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(3600);

/// How long before expiry an automatic lease is renewed.
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(60);

/// Lease requested for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lease {
    /// Renewed automatically for as long as the subscription lives.
    #[default]
    Auto,
    /// Never renewed; the subscription closes once it runs out.
    Fixed(Duration),
}

impl Lease {
    /// Seconds sent to the server. Partial seconds round up, since `0`
    /// would cancel the subscription.
    pub fn seconds(&self, config: &LeaseConfig) -> EventResult<u64> {
        let duration = match self {
            Self::Auto => config.lease,
            Self::Fixed(d) => *d,
        };
        if duration.is_zero() {
            return Err(EventError::config("lease must be positive"));
        }
        Ok(duration.as_secs() + u64::from(duration.subsec_nanos() > 0))
    }
}

/// Renewal parameters for automatic leases.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease requested on every (re)subscription.
    pub lease: Duration,
    /// Renew this long before the lease runs out.
    pub margin: Duration,
    /// Random fraction (0.0-1.0) of the renewal interval to renew early by.
    pub jitter_fraction: f64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            margin: DEFAULT_RENEWAL_MARGIN,
            jitter_fraction: 0.0,
        }
    }
}

impl LeaseConfig {
    pub fn new(lease: Duration, margin: Duration) -> Self {
        Self {
            lease,
            margin,
            ..Default::default()
        }
    }

    /// Builder: set jitter fraction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> EventResult<()> {
        if self.margin >= self.lease {
            return Err(EventError::config(format!(
                "renewal margin ({:?}) must be shorter than the lease ({:?})",
                self.margin, self.lease
            )));
        }
        Ok(())
    }

    /// Time between renewals without jitter.
    pub fn renewal_interval(&self) -> Duration {
        self.lease.saturating_sub(self.margin)
    }

    /// Delay until the next renewal.
    ///
    /// Jitter is only ever subtracted, so renewal never happens later than
    /// `lease - margin` after the previous one.
    pub fn next_renewal_delay(&self) -> Duration {
        let base = self.renewal_interval();
        let range = base.as_secs_f64() * self.jitter_fraction;
        if range <= 0.0 {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..=range);
        base.saturating_sub(Duration::from_secs_f64(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_renews_every_59_minutes() {
        let config = LeaseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.renewal_interval(), Duration::from_secs(3540));
        assert_eq!(config.next_renewal_delay(), Duration::from_secs(3540));
    }

    #[test]
    fn jitter_only_renews_early() {
        let config = LeaseConfig::default().with_jitter(0.1);
        for _ in 0..100 {
            let delay = config.next_renewal_delay();
            assert!(delay <= Duration::from_secs(3540));
            assert!(delay >= Duration::from_secs(3186));
        }
    }

    #[test]
    fn margin_must_fit_in_lease() {
        let config = LeaseConfig::new(Duration::from_secs(60), Duration::from_secs(60));
        assert!(matches!(config.validate(), Err(EventError::InvalidConfig(_))));
    }

    #[test]
    fn lease_seconds() {
        let config = LeaseConfig::default();
        assert_eq!(Lease::Auto.seconds(&config).unwrap(), 3600);
        assert_eq!(Lease::Fixed(Duration::from_secs(30)).seconds(&config).unwrap(), 30);
        assert_eq!(Lease::Fixed(Duration::from_millis(200)).seconds(&config).unwrap(), 1);
        assert!(Lease::Fixed(Duration::ZERO).seconds(&config).is_err());
    }
}
