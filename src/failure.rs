// Copyright 2020 Joyent, Inc.

//! Per-node failure accounting.
//!
//! A [`FailurePolicy`] is the decision function consulted every time a socket
//! belonging to a node fails: it answers whether the node should now be
//! considered dead. One policy instance is created per node (via the
//! configured [`FailurePolicyFactory`]) and lives for the node's whole
//! lifetime, surviving pool replacements on resurrection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use derive_more::{Add, AddAssign, Display, From, Into};

/// A count of recent socket failures on one node.
#[derive(
    Add, AddAssign, Clone, Copy, Debug, Display, Eq, From, Into, Ord,
    PartialOrd, PartialEq,
)]
pub struct FailureCount(u32);

/// Decides whether a node should be marked dead, given that one of its
/// sockets just failed. Stateful across the node's lifetime.
pub trait FailurePolicy: Send {
    /// Records a failure and reports whether the failure threshold has been
    /// crossed.
    fn should_fail(&mut self) -> bool;
}

/// Creates one [`FailurePolicy`] per node. Policies are never shared between
/// nodes.
pub trait FailurePolicyFactory: Send + Sync {
    fn create(&self, endpoint: SocketAddr) -> Box<dyn FailurePolicy>;
}

/// Fails a node after `failure_threshold` failures that each arrive within
/// `reset_after` of the previous one. A quiet period longer than
/// `reset_after` ages the accumulated failures out and the count restarts at
/// one.
pub struct ThrottlingFailurePolicy {
    failure_threshold: FailureCount,
    reset_after: Duration,
    count: FailureCount,
    last_failure: Option<Instant>,
}

impl ThrottlingFailurePolicy {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        ThrottlingFailurePolicy {
            failure_threshold: failure_threshold.into(),
            reset_after,
            count: 0.into(),
            last_failure: None,
        }
    }
}

impl FailurePolicy for ThrottlingFailurePolicy {
    fn should_fail(&mut self) -> bool {
        let now = Instant::now();
        let windowed = match self.last_failure {
            Some(last) => now.duration_since(last) <= self.reset_after,
            None => false,
        };

        if windowed {
            self.count += 1.into();
        } else {
            self.count = 1.into();
        }
        self.last_failure = Some(now);

        self.count >= self.failure_threshold
    }
}

/// Factory for [`ThrottlingFailurePolicy`] instances. The defaults (five
/// failures within a two second window) match the stock socket pool
/// configuration.
pub struct ThrottlingFailurePolicyFactory {
    pub failure_threshold: u32,
    pub reset_after: Duration,
}

impl Default for ThrottlingFailurePolicyFactory {
    fn default() -> Self {
        ThrottlingFailurePolicyFactory {
            failure_threshold: 5,
            reset_after: Duration::from_millis(2000),
        }
    }
}

impl FailurePolicyFactory for ThrottlingFailurePolicyFactory {
    fn create(&self, _endpoint: SocketAddr) -> Box<dyn FailurePolicy> {
        Box::new(ThrottlingFailurePolicy::new(
            self.failure_threshold,
            self.reset_after,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fails_after_threshold_within_window() {
        let mut policy =
            ThrottlingFailurePolicy::new(3, Duration::from_secs(10));
        assert!(!policy.should_fail());
        assert!(!policy.should_fail());
        assert!(policy.should_fail());
    }

    #[test]
    fn quiet_period_resets_the_count() {
        let mut policy =
            ThrottlingFailurePolicy::new(2, Duration::from_millis(50));
        assert!(!policy.should_fail());
        thread::sleep(Duration::from_millis(80));
        assert!(!policy.should_fail());
        assert!(policy.should_fail());
    }

    #[test]
    fn threshold_of_one_fails_immediately() {
        let mut policy =
            ThrottlingFailurePolicy::new(1, Duration::from_secs(1));
        assert!(policy.should_fail());
    }
}
