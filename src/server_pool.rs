// Copyright 2020 Joyent, Inc.

//! The cluster-wide server pool.
//!
//! Owns the full node set and the current locator, listens for node failure
//! events, and runs the resurrection timer. How recovery works:
//!
//! 1. the timer is idle until a node fails
//! 2. a failure event rebuilds the locator from the alive subset and arms
//!    the timer to fire after the dead timeout
//! 3. further failures while the timer is armed only rebuild the locator;
//!    the dead nodes are probed at the already scheduled tick
//! 4. each tick pings every dead node; any resurrection rebuilds the
//!    locator, and the timer re-arms while at least one node is still dead
//! 5. once every node is alive again the timer goes idle
//!
//! Failure handling and resurrection are serialized by a single dead-sync
//! lock, so locator rebuilds from the two paths never race each other.
//! Readers of the locator never take that lock: the locator reference is
//! swapped atomically and `locate` only ever observes a fully built ring.

use std::net::SocketAddr;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::mpsc::TrySendError;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use slog::{debug, info, o, warn, Logger};

use crate::config::ClientConfig;
use crate::locator::{NodeLocator, RingLocator, SingleNodeLocator};
use crate::node::{Node, NodeEvent};

struct RezState {
    timer_active: bool,
    disposed: bool,
}

struct Inner {
    nodes: Vec<Arc<Node>>,
    locator: RwLock<Arc<dyn NodeLocator>>,
    dead_sync: Mutex<RezState>,
    timer: timer::Timer,
    rez_guard: Mutex<Option<timer::Guard>>,
    subscribers: Mutex<Vec<SyncSender<SocketAddr>>>,
    configured_servers: usize,
    mutations: u32,
    dead_timeout: chrono::Duration,
    log: Logger,
}

/// The composition of locator, nodes and failure handling that backs a
/// client.
pub struct ServerPool {
    inner: Arc<Inner>,
    events_tx: Sender<NodeEvent>,
    listener: Option<thread::JoinHandle<()>>,
}

impl ServerPool {
    /// Creates one node per configured address, wires their failure events
    /// into a listener thread, and builds the initial locator over the full
    /// node set.
    pub fn start(config: &ClientConfig, log: Logger) -> ServerPool {
        let (events_tx, events_rx) = channel();

        let nodes: Vec<Arc<Node>> = config
            .servers
            .iter()
            .map(|endpoint| {
                Arc::new(Node::new(
                    *endpoint,
                    config.pool.clone(),
                    config.tls.clone(),
                    config.auth.clone(),
                    events_tx.clone(),
                    log.new(o!("endpoint" => endpoint.to_string())),
                ))
            })
            .collect();

        let dead_timeout = chrono::Duration::from_std(config.pool.dead_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));

        let locator = build_locator(
            config.servers.len(),
            config.server_address_mutations,
            nodes.clone(),
        );

        let inner = Arc::new(Inner {
            nodes,
            locator: RwLock::new(locator),
            dead_sync: Mutex::new(RezState {
                timer_active: false,
                disposed: false,
            }),
            timer: timer::Timer::new(),
            rez_guard: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            configured_servers: config.servers.len(),
            mutations: config.server_address_mutations,
            dead_timeout,
            log,
        });

        let listener_inner = Arc::clone(&inner);
        let listener = thread::spawn(move || {
            failure_recv_loop(events_rx, listener_inner)
        });

        ServerPool {
            inner,
            events_tx,
            listener: Some(listener),
        }
    }

    /// Routes a key to its owning node via the current locator.
    pub fn locate(&self, key: &str) -> Option<Arc<Node>> {
        let locator = Arc::clone(&*self.inner.locator.read().unwrap());
        locator.locate(key)
    }

    /// The nodes backing the current locator, i.e. the alive set.
    pub fn working_nodes(&self) -> Vec<Arc<Node>> {
        let locator = Arc::clone(&*self.inner.locator.read().unwrap());
        locator.working_nodes()
    }

    /// Registers an advisory observer for node failures. Events are
    /// delivered best-effort over a bounded channel; routing never waits on
    /// subscribers.
    pub fn subscribe_failures(&self) -> Receiver<SocketAddr> {
        let (tx, rx) = sync_channel(32);
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Tears down the pool: locator first (it may still enumerate nodes),
    /// then every node, then the resurrection timer and the listener
    /// thread.
    pub fn shutdown(&mut self) {
        {
            let mut rez = self.inner.dead_sync.lock().unwrap();
            if rez.disposed {
                return;
            }
            rez.disposed = true;
        }

        {
            let mut slot = self.inner.locator.write().unwrap();
            *slot = Arc::new(SingleNodeLocator::new(vec![]));
        }

        for node in &self.inner.nodes {
            node.dispose();
        }

        // dropping the guard cancels any scheduled probe
        *self.inner.rez_guard.lock().unwrap() = None;

        let _ = self.events_tx.send(NodeEvent::Stop);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }

        debug!(self.inner.log, "server pool shut down");
    }
}

impl Drop for ServerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_locator(
    configured_servers: usize,
    mutations: u32,
    nodes: Vec<Arc<Node>>,
) -> Arc<dyn NodeLocator> {
    if configured_servers == 1 {
        Arc::new(SingleNodeLocator::new(nodes))
    } else {
        Arc::new(RingLocator::new(nodes, mutations))
    }
}

// Replaces the locator with one built from the currently alive subset. The
// swap is atomic: readers either see the old ring or the new one, never a
// partial build.
fn rebuild_locator(inner: &Inner) {
    let alive: Vec<Arc<Node>> = inner
        .nodes
        .iter()
        .filter(|node| node.is_alive())
        .cloned()
        .collect();

    debug!(inner.log, "rebuilding locator";
           "alive" => alive.len(),
           "total" => inner.nodes.len());

    let locator =
        build_locator(inner.configured_servers, inner.mutations, alive);

    let mut slot = inner.locator.write().unwrap();
    *slot = locator;
}

fn failure_recv_loop(rx: Receiver<NodeEvent>, inner: Arc<Inner>) {
    while let Ok(event) = rx.recv() {
        match event {
            NodeEvent::Failed(endpoint) => handle_node_failed(&inner, endpoint),
            NodeEvent::Stop => break,
        }
    }
    debug!(inner.log, "failure listener exiting");
}

fn handle_node_failed(inner: &Arc<Inner>, endpoint: SocketAddr) {
    let mut rez = inner.dead_sync.lock().unwrap();
    if rez.disposed {
        warn!(inner.log,
              "got a node failure but the pool is already disposed, ignoring";
              "endpoint" => %endpoint);
        return;
    }

    info!(inner.log, "node failed"; "endpoint" => %endpoint);

    // bubble the failure up to subscribers; slow ones miss events rather
    // than stall this thread
    inner.subscribers.lock().unwrap().retain(|tx| {
        match tx.try_send(endpoint) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    });

    rebuild_locator(inner);

    if !rez.timer_active {
        debug!(inner.log, "starting the recovery timer");
        rez.timer_active = true;
        arm_timer(inner);
    }
}

fn arm_timer(inner: &Arc<Inner>) {
    // the guard's callback must not keep the pool alive on its own
    let weak = Arc::downgrade(inner);
    let guard = inner.timer.schedule_with_delay(inner.dead_timeout, move || {
        if let Some(inner) = weak.upgrade() {
            resurrect_dead_nodes(&inner);
        }
    });
    *inner.rez_guard.lock().unwrap() = Some(guard);
}

fn resurrect_dead_nodes(inner: &Arc<Inner>) {
    let mut rez = inner.dead_sync.lock().unwrap();
    if rez.disposed {
        warn!(inner.log,
              "resurrection timer fired but the pool is already disposed, \
               ignoring");
        return;
    }

    debug!(inner.log, "checking the dead servers");

    let mut changed = false;
    let mut dead_count = 0;

    for node in &inner.nodes {
        if node.is_alive() {
            continue;
        }
        if node.ping() {
            changed = true;
        } else {
            dead_count += 1;
        }
    }

    if changed {
        rebuild_locator(inner);
    }

    if dead_count == 0 {
        debug!(inner.log, "no dead servers left, suspending the timer");
        rez.timer_active = false;
        *inner.rez_guard.lock().unwrap() = None;
    } else {
        debug!(inner.log, "servers still dead, rescheduling the probe";
               "dead" => dead_count);
        arm_timer(inner);
    }
}
