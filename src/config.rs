// Copyright 2020 Joyent, Inc.

//! Client and socket pool configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use crate::auth::AuthProvider;
use crate::error::Error;
use crate::failure::{FailurePolicyFactory, ThrottlingFailurePolicyFactory};

// Ring positions inserted per node by the default locator.
const DEFAULT_SERVER_ADDRESS_MUTATIONS: u32 = 100;

/// Settings for upgrading pooled sockets to TLS after the TCP connect.
#[derive(Clone)]
pub struct TlsOptions {
    /// Host name presented for certificate validation.
    pub domain: String,
    /// Skip certificate validation. Only for test setups.
    pub accept_invalid_certs: bool,
}

/// Sizing and timeout configuration for the per-node socket pools.
#[derive(Clone)]
pub struct SocketPoolConfig {
    /// Number of sockets created eagerly the first time a pool is used.
    pub min_pool_size: usize,
    /// Hard upper bound on sockets per node, idle and checked out combined.
    pub max_pool_size: usize,
    /// Bound on establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Bound on every read and write on a pooled socket.
    pub receive_timeout: Duration,
    /// How long an acquisition may wait for a pool permit before it fails
    /// with a pool-exhausted error.
    pub queue_timeout: Duration,
    /// Idle sockets older than this are destroyed instead of reused. `None`
    /// disables idle eviction.
    pub idle_timeout: Option<Duration>,
    /// Interval between resurrection probes while at least one node is dead.
    pub dead_timeout: Duration,
    /// Creates the per-node failure policy.
    pub failure_policy: Arc<dyn FailurePolicyFactory>,
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        SocketPoolConfig {
            min_pool_size: 5,
            max_pool_size: 100,
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_millis(100),
            idle_timeout: None,
            dead_timeout: Duration::from_secs(10),
            failure_policy: Arc::new(ThrottlingFailurePolicyFactory::default()),
        }
    }
}

impl SocketPoolConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.max_pool_size == 0 {
            return Err(Error::InvalidConfiguration(
                "max_pool_size must be at least 1".into(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Error::InvalidConfiguration(
                "min_pool_size must not exceed max_pool_size".into(),
            ));
        }
        if self.connect_timeout == Duration::from_millis(0)
            || self.receive_timeout == Duration::from_millis(0)
        {
            return Err(Error::InvalidConfiguration(
                "connect_timeout and receive_timeout must be non-zero".into(),
            ));
        }
        if self.dead_timeout == Duration::from_millis(0) {
            return Err(Error::InvalidConfiguration(
                "dead_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`MemcachedClient`](crate::client::MemcachedClient).
#[derive(Clone)]
pub struct ClientConfig {
    /// The cluster members, in configuration order. The order matters: the
    /// hash ring built from these addresses is deterministic for a fixed
    /// input order.
    pub servers: Vec<SocketAddr>,
    pub pool: SocketPoolConfig,
    /// Optional TLS upgrade applied to every socket.
    pub tls: Option<TlsOptions>,
    /// Optional SASL authentication applied to every socket before it may
    /// enter a pool.
    pub auth: Option<Arc<dyn AuthProvider>>,
    /// How many positions each node occupies on the hash ring.
    pub server_address_mutations: u32,
    /// Logger for the client and everything under it. Falls back to the
    /// `slog-stdlog` drain when not set.
    pub log: Option<Logger>,
}

impl ClientConfig {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        ClientConfig {
            servers,
            pool: SocketPoolConfig::default(),
            tls: None,
            auth: None,
            server_address_mutations: DEFAULT_SERVER_ADDRESS_MUTATIONS,
            log: None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::InvalidConfiguration(
                "at least one server address is required".into(),
            ));
        }
        if self.server_address_mutations == 0 {
            return Err(Error::InvalidConfiguration(
                "server_address_mutations must be at least 1".into(),
            ));
        }
        self.pool.validate()
    }
}
