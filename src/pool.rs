// Copyright 2020 Joyent, Inc.

//! The per-node socket pool.
//!
//! Admission is controlled by a counting permit bounded by the maximum pool
//! size; idle sockets live on a free stack. Both share one briefly-held
//! mutex — no lock is ever held across connect or I/O. Sockets are handed
//! out wrapped in a [`PoolConnection`] whose `Drop` routes them back through
//! the pool's release logic, so a socket is always either returned or
//! destroyed, never silently leaked.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use slog::{debug, error, info, warn, Logger};

use crate::auth::AuthProvider;
use crate::config::{SocketPoolConfig, TlsOptions};
use crate::error::Error;
use crate::failure::FailurePolicy;
use crate::node::NodeEvent;
use crate::proto::ops;
use crate::socket::PooledSocket;

struct PoolState {
    permits: usize,
    free: Vec<PooledSocket>,
}

/// A bounded pool of sockets for one node. Created by the node, replaced
/// wholesale when a dead node is resurrected.
pub struct SocketPool {
    endpoint: SocketAddr,
    config: SocketPoolConfig,
    tls: Option<TlsOptions>,
    auth: Option<Arc<dyn AuthProvider>>,
    alive: AtomicBool,
    state: Mutex<PoolState>,
    available: Condvar,
    init: Mutex<bool>,
    policy: Arc<Mutex<Box<dyn FailurePolicy>>>,
    events: Sender<NodeEvent>,
    log: Logger,
}

impl SocketPool {
    pub fn new(
        endpoint: SocketAddr,
        config: SocketPoolConfig,
        tls: Option<TlsOptions>,
        auth: Option<Arc<dyn AuthProvider>>,
        policy: Arc<Mutex<Box<dyn FailurePolicy>>>,
        events: Sender<NodeEvent>,
        log: Logger,
    ) -> Self {
        let state = PoolState {
            permits: config.max_pool_size,
            free: Vec::with_capacity(config.max_pool_size),
        };

        SocketPool {
            endpoint,
            config,
            tls,
            auth,
            alive: AtomicBool::new(true),
            state: Mutex::new(state),
            available: Condvar::new(),
            init: Mutex::new(false),
            policy,
            events,
            log,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Hands out a ready-to-use socket, or a typed failure: the pool is
    /// dead, the queue timeout elapsed with every permit claimed, or a fresh
    /// socket could not be created.
    pub fn acquire(self: Arc<Self>) -> Result<PoolConnection, Error> {
        if !self.is_alive() {
            debug!(self.log, "pool is dead, not handing out sockets";
                   "endpoint" => %self.endpoint);
            return Err(Error::PoolDead(self.endpoint));
        }

        self.ensure_initialized();

        let deadline = Instant::now() + self.config.queue_timeout;
        let mut state = self.state.lock().unwrap();
        while state.permits == 0 {
            if !self.is_alive() {
                return Err(Error::PoolDead(self.endpoint));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(self.log, "pool is full, timing out";
                       "endpoint" => %self.endpoint);
                return Err(Error::PoolExhausted(self.endpoint));
            }
            let (guard, wait) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if wait.timed_out() && state.permits == 0 {
                debug!(self.log, "pool is full, timing out";
                       "endpoint" => %self.endpoint);
                return Err(Error::PoolExhausted(self.endpoint));
            }
        }
        state.permits -= 1;

        // the pool may have died while we were waiting on the permit
        if !self.is_alive() {
            state.permits += 1;
            drop(state);
            self.available.notify_one();
            return Err(Error::PoolDead(self.endpoint));
        }

        let popped = state.free.pop();
        drop(state);

        if let Some(mut socket) = popped {
            let stale = match self.config.idle_timeout {
                Some(idle) => socket.last_used().elapsed() > idle,
                None => false,
            };

            if stale {
                info!(self.log, "destroying idle socket";
                      "endpoint" => %self.endpoint,
                      "instance_id" => %socket.instance_id());
                drop(socket);
            // fall through to creating a replacement
            } else {
                match socket.reset() {
                    Ok(()) => {
                        socket.touch();
                        debug!(self.log, "reusing pooled socket";
                               "instance_id" => %socket.instance_id());
                        return Ok(PoolConnection::new(self, socket));
                    }
                    Err(e) => {
                        error!(self.log, "failed to reset an acquired socket";
                               "endpoint" => %self.endpoint,
                               "error" => %e);
                        drop(socket);
                        self.release_permit();
                        self.mark_as_dead();
                        return Err(Error::CreateFailed(
                            self.endpoint,
                            Box::new(e),
                        ));
                    }
                }
            }
        }

        match self.create_socket() {
            Ok(socket) => Ok(PoolConnection::new(self, socket)),
            Err(e) => {
                error!(self.log, "failed to create socket";
                       "endpoint" => %self.endpoint,
                       "error" => %e);
                // return the permit before consulting the failure policy: if
                // the policy keeps the pool alive, dead attempts must not
                // fill up the admission budget
                self.release_permit();
                self.mark_as_dead();
                Err(Error::CreateFailed(self.endpoint, Box::new(e)))
            }
        }
    }

    // Eagerly creates the configured minimum of sockets, exactly once.
    // Concurrent first callers block here until the winner is done.
    fn ensure_initialized(&self) {
        let mut initialized = self.init.lock().unwrap();
        if *initialized {
            return;
        }
        *initialized = true;

        for i in 0..self.config.min_pool_size {
            match self.create_socket() {
                Ok(socket) => {
                    self.state.lock().unwrap().free.push(socket);
                }
                Err(e) => {
                    error!(self.log, "could not init pool";
                           "endpoint" => %self.endpoint,
                           "socket" => i,
                           "error" => %e);
                    self.mark_as_dead();
                    break;
                }
            }
            if !self.is_alive() {
                break;
            }
        }

        debug!(self.log, "pool initialized";
               "endpoint" => %self.endpoint,
               "sockets" => self.config.min_pool_size);
    }

    fn create_socket(&self) -> Result<PooledSocket, Error> {
        let mut socket = PooledSocket::connect(
            self.endpoint,
            self.config.connect_timeout,
            self.config.receive_timeout,
            self.tls.as_ref(),
            &self.log,
        )?;

        // an unauthenticated socket must never enter the pool
        if let Some(auth) = &self.auth {
            ops::authenticate(&mut socket, auth.as_ref())?;
        }

        Ok(socket)
    }

    // Invoked only through the PoolConnection guard, never by operation
    // code.
    fn release(&self, socket: PooledSocket) {
        debug!(self.log, "releasing socket";
               "instance_id" => %socket.instance_id(),
               "socket_alive" => socket.is_alive());

        if self.is_alive() {
            if socket.is_alive() {
                let mut state = self.state.lock().unwrap();
                state.free.push(socket);
                state.permits += 1;
                drop(state);
                self.available.notify_one();
            } else {
                drop(socket);
                self.mark_as_dead();
                self.release_permit();
            }
        } else {
            // one socket died, so probably all of them did; the pool is
            // already marked dead and drains through here
            drop(socket);
            self.release_permit();
        }
    }

    fn release_permit(&self) {
        let mut state = self.state.lock().unwrap();
        state.permits += 1;
        drop(state);
        self.available.notify_one();
    }

    // Consults the failure policy; if the threshold is crossed, flips the
    // pool dead and pushes a failure event for the server pool to act on.
    fn mark_as_dead(&self) {
        let should_fail = self.policy.lock().unwrap().should_fail();
        debug!(self.log, "failure policy consulted";
               "endpoint" => %self.endpoint,
               "should_fail" => should_fail);

        if should_fail && self.alive.swap(false, Ordering::SeqCst) {
            warn!(self.log, "marking node as dead";
                  "endpoint" => %self.endpoint);
            self.available.notify_all();
            let _ = self.events.send(NodeEvent::Failed(self.endpoint));
        }
    }

    /// Flips the pool dead and closes every idle socket. Checked-out sockets
    /// are destroyed as their guards release them.
    pub fn dispose(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let drained = {
            let mut state = self.state.lock().unwrap();
            state.free.drain(..).count()
        };
        self.available.notify_all();

        debug!(self.log, "pool disposed";
               "endpoint" => %self.endpoint,
               "closed" => drained);
    }
}

/// A socket checked out of a pool. Dereferences to the socket; dropping it
/// returns the socket to the pool (or destroys it, when either side is no
/// longer alive).
pub struct PoolConnection {
    pool: Arc<SocketPool>,
    socket: Option<PooledSocket>,
}

impl PoolConnection {
    fn new(pool: Arc<SocketPool>, socket: PooledSocket) -> Self {
        PoolConnection {
            pool,
            socket: Some(socket),
        }
    }
}

impl Deref for PoolConnection {
    type Target = PooledSocket;

    fn deref(&self) -> &PooledSocket {
        self.socket.as_ref().unwrap()
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut PooledSocket {
        self.socket.as_mut().unwrap()
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.pool.release(socket);
        }
    }
}
