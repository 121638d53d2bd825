// Copyright 2020 Joyent, Inc.

//! One memcached server endpoint.
//!
//! A node owns the socket pool for its endpoint plus the failure policy that
//! decides when the node is dead. Resurrection replaces the pool wholesale:
//! repairing a dead pool in place would race against in-flight acquisitions
//! still holding a reference to it, so `ping` builds a brand new pool, swaps
//! it in, and disposes the old one afterwards.

use std::mem;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};

use slog::{debug, info, Logger};

use crate::auth::AuthProvider;
use crate::config::{SocketPoolConfig, TlsOptions};
use crate::error::Error;
use crate::failure::FailurePolicy;
use crate::pool::{PoolConnection, SocketPool};
use crate::proto::ops;
use crate::socket::PooledSocket;

/// Notifications a node sends to the server pool that owns it.
pub enum NodeEvent {
    /// The failure policy crossed its threshold; the node is now dead.
    Failed(SocketAddr),
    /// Shut down the listener receiving these events.
    Stop,
}

pub struct Node {
    endpoint: SocketAddr,
    config: SocketPoolConfig,
    tls: Option<TlsOptions>,
    auth: Option<Arc<dyn AuthProvider>>,
    policy: Arc<Mutex<Box<dyn FailurePolicy>>>,
    events: Sender<NodeEvent>,
    pool: RwLock<Arc<SocketPool>>,
    // node-level lock serializing resurrection against disposal; true once
    // disposed
    sync: Mutex<bool>,
    log: Logger,
}

impl Node {
    pub fn new(
        endpoint: SocketAddr,
        config: SocketPoolConfig,
        tls: Option<TlsOptions>,
        auth: Option<Arc<dyn AuthProvider>>,
        events: Sender<NodeEvent>,
        log: Logger,
    ) -> Self {
        let policy = Arc::new(Mutex::new(
            config.failure_policy.create(endpoint),
        ));

        let pool = Arc::new(SocketPool::new(
            endpoint,
            config.clone(),
            tls.clone(),
            auth.clone(),
            Arc::clone(&policy),
            events.clone(),
            log.clone(),
        ));

        Node {
            endpoint,
            config,
            tls,
            auth,
            policy,
            events,
            pool: RwLock::new(pool),
            sync: Mutex::new(false),
            log,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Whether the node is working. This is the cached state maintained by
    /// the pool; use [`ping`](Node::ping) to probe and update it.
    pub fn is_alive(&self) -> bool {
        self.pool.read().unwrap().is_alive()
    }

    /// Checks out a pooled socket for this node.
    pub fn acquire(&self) -> Result<PoolConnection, Error> {
        let pool = Arc::clone(&*self.pool.read().unwrap());
        pool.acquire()
    }

    /// Probes the node. A no-op while alive. For a dead node, attempts a
    /// throwaway connection (including the authentication handshake when
    /// configured); on success the socket pool is replaced with a freshly
    /// built one and the node reports alive again.
    ///
    /// This path runs rarely — only from the resurrection timer.
    pub fn ping(&self) -> bool {
        if self.is_alive() {
            return true;
        }

        let disposed = self.sync.lock().unwrap();
        if *disposed {
            return false;
        }

        match self.probe() {
            Ok(()) => {
                if self.pool.read().unwrap().is_alive() {
                    return true;
                }

                let new_pool = Arc::new(SocketPool::new(
                    self.endpoint,
                    self.config.clone(),
                    self.tls.clone(),
                    self.auth.clone(),
                    Arc::clone(&self.policy),
                    self.events.clone(),
                    self.log.clone(),
                ));

                // swap first, dispose after: acquisitions racing this hold
                // an Arc to the old pool and drain through its dead path
                let old_pool = {
                    let mut slot = self.pool.write().unwrap();
                    mem::replace(&mut *slot, new_pool)
                };
                old_pool.dispose();

                info!(self.log, "node resurrected";
                      "endpoint" => %self.endpoint);
                true
            }
            Err(e) => {
                debug!(self.log, "ping failed, node stays dead";
                       "endpoint" => %self.endpoint,
                       "error" => %e);
                false
            }
        }
    }

    fn probe(&self) -> Result<(), Error> {
        let mut socket = PooledSocket::connect(
            self.endpoint,
            self.config.connect_timeout,
            self.config.receive_timeout,
            self.tls.as_ref(),
            &self.log,
        )?;
        if let Some(auth) = &self.auth {
            ops::authenticate(&mut socket, auth.as_ref())?;
        }
        Ok(())
    }

    /// Tears the node down. Safe against a concurrent `ping`.
    pub fn dispose(&self) {
        let mut disposed = self.sync.lock().unwrap();
        if *disposed {
            return;
        }
        *disposed = true;
        self.pool.read().unwrap().dispose();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.dispose();
    }
}
