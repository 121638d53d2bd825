// Copyright 2020 Joyent, Inc.

//! The memcached client: the operation surface higher layers consume.
//!
//! Every operation routes its key through the server pool's locator,
//! acquires a pooled socket from the owning node, runs the wire exchange,
//! and releases the socket by dropping the guard. Failures observed on the
//! socket feed the node's failure policy on release.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use slog::{o, warn, Drain, Logger};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::node::Node;
use crate::proto::ops;
use crate::proto::ops::{
    CasResult, ConcatMode, CounterMode, CounterResult, GetResult,
    OperationStatus, StoreMode, StoreResult,
};
use crate::server_pool::ServerPool;
use crate::socket::PooledSocket;
use crate::transcoder::CacheItem;

/// Raw statistics collected from the cluster, one key/value map per server,
/// plus typed accessors for the common entries.
#[derive(Debug, Default)]
pub struct ServerStats {
    results: HashMap<SocketAddr, HashMap<String, String>>,
}

impl ServerStats {
    /// The raw value of `key` as reported by `server`.
    pub fn raw(&self, server: SocketAddr, key: &str) -> Option<&str> {
        self.results
            .get(&server)
            .and_then(|stats| stats.get(key))
            .map(String::as_str)
    }

    /// How long `server` has been running.
    pub fn uptime(&self, server: SocketAddr) -> Option<Duration> {
        self.raw(server, "uptime")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// The version string `server` reported.
    pub fn version(&self, server: SocketAddr) -> Option<&str> {
        self.raw(server, "version")
    }

    /// The servers that contributed to this snapshot.
    pub fn servers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.results.keys()
    }

    fn insert(&mut self, server: SocketAddr, stats: HashMap<String, String>) {
        self.results.insert(server, stats);
    }
}

/// A client for a memcached cluster.
pub struct MemcachedClient {
    pool: ServerPool,
    log: Logger,
}

impl MemcachedClient {
    /// Validates the configuration and starts the server pool: one node per
    /// configured address, the initial locator over the full set.
    pub fn new(config: ClientConfig) -> Result<MemcachedClient, Error> {
        config.validate()?;

        let log = config
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let pool = ServerPool::start(&config, log.clone());

        Ok(MemcachedClient { pool, log })
    }

    /// The endpoint `key` currently routes to. Diagnostics only; membership
    /// changes can re-route the key before a subsequent operation runs.
    pub fn locate(&self, key: &str) -> Option<SocketAddr> {
        self.pool.locate(key).map(|node| node.endpoint())
    }

    /// The endpoints of the currently routable nodes.
    pub fn working_servers(&self) -> Vec<SocketAddr> {
        self.pool
            .working_nodes()
            .iter()
            .map(|node| node.endpoint())
            .collect()
    }

    /// Registers an advisory observer for node failures.
    pub fn node_failures(&self) -> Receiver<SocketAddr> {
        self.pool.subscribe_failures()
    }

    /// Fetches one key. A miss is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<GetResult>, Error> {
        self.with_socket(key, |socket| ops::get(socket, key))
    }

    /// Stores under `mode`. A `cas` of zero stores unconditionally.
    pub fn store(
        &self,
        mode: StoreMode,
        key: &str,
        item: &CacheItem,
        expiration: u32,
    ) -> Result<StoreResult, Error> {
        self.with_socket(key, |socket| {
            ops::store(socket, mode, key, item, expiration, 0)
        })
    }

    pub fn set(
        &self,
        key: &str,
        item: &CacheItem,
        expiration: u32,
    ) -> Result<StoreResult, Error> {
        self.store(StoreMode::Set, key, item, expiration)
    }

    pub fn add(
        &self,
        key: &str,
        item: &CacheItem,
        expiration: u32,
    ) -> Result<StoreResult, Error> {
        self.store(StoreMode::Add, key, item, expiration)
    }

    pub fn replace(
        &self,
        key: &str,
        item: &CacheItem,
        expiration: u32,
    ) -> Result<StoreResult, Error> {
        self.store(StoreMode::Replace, key, item, expiration)
    }

    /// Stores conditionally on the server still holding `cas`. The result
    /// carries only a success flag and the current CAS; the reason for a
    /// failure (missing key, stale token, other error) is not
    /// distinguishable here.
    pub fn cas(
        &self,
        mode: StoreMode,
        key: &str,
        item: &CacheItem,
        expiration: u32,
        cas: u64,
    ) -> Result<CasResult, Error> {
        let result = self.with_socket(key, |socket| {
            ops::store(socket, mode, key, item, expiration, cas)
        })?;
        Ok(CasResult {
            success: result.success,
            cas: result.cas,
        })
    }

    pub fn append(
        &self,
        key: &str,
        data: &[u8],
        cas: u64,
    ) -> Result<CasResult, Error> {
        self.with_socket(key, |socket| {
            ops::concat(socket, ConcatMode::Append, key, data, cas)
        })
    }

    pub fn prepend(
        &self,
        key: &str,
        data: &[u8],
        cas: u64,
    ) -> Result<CasResult, Error> {
        self.with_socket(key, |socket| {
            ops::concat(socket, ConcatMode::Prepend, key, data, cas)
        })
    }

    /// Adds `delta` to the numeric value under `key`, initializing it to
    /// `initial` when absent.
    pub fn increment(
        &self,
        key: &str,
        initial: u64,
        delta: u64,
        expiration: u32,
    ) -> Result<CounterResult, Error> {
        self.with_socket(key, |socket| {
            ops::counter(
                socket,
                CounterMode::Increment,
                key,
                delta,
                initial,
                expiration,
            )
        })
    }

    pub fn decrement(
        &self,
        key: &str,
        initial: u64,
        delta: u64,
        expiration: u32,
    ) -> Result<CounterResult, Error> {
        self.with_socket(key, |socket| {
            ops::counter(
                socket,
                CounterMode::Decrement,
                key,
                delta,
                initial,
                expiration,
            )
        })
    }

    pub fn remove(&self, key: &str) -> Result<OperationStatus, Error> {
        self.with_socket(key, |socket| ops::delete(socket, key))
    }

    /// Fetches many keys at once. Keys are grouped by owning node and each
    /// group is pipelined over a single connection. Missing keys simply
    /// have no entry in the result. A node that fails mid-fetch contributes
    /// nothing; its keys read as misses while its failure is handled
    /// through the usual policy.
    pub fn multi_get(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, GetResult>, Error> {
        let mut grouped: HashMap<SocketAddr, (Arc<Node>, Vec<&str>)> =
            HashMap::new();

        for &key in keys {
            let node = self.pool.locate(key).ok_or(Error::NoAvailableNodes)?;
            grouped
                .entry(node.endpoint())
                .or_insert_with(|| (node, Vec::new()))
                .1
                .push(key);
        }

        let mut results = HashMap::with_capacity(keys.len());
        for (endpoint, (node, node_keys)) in grouped {
            match Self::multi_get_from(&node, &node_keys) {
                Ok(partial) => results.extend(partial),
                Err(e) => {
                    warn!(self.log, "multi-get leg failed";
                          "endpoint" => %endpoint,
                          "keys" => node_keys.len(),
                          "error" => %e);
                }
            }
        }

        Ok(results)
    }

    fn multi_get_from(
        node: &Arc<Node>,
        keys: &[&str],
    ) -> Result<HashMap<String, GetResult>, Error> {
        let mut socket = node.acquire()?;
        ops::multi_get(&mut socket, keys)
    }

    /// Collects statistics from every working server. `key` selects a stats
    /// sub-group when given. Servers that fail to answer are skipped.
    pub fn stats(&self, key: Option<&str>) -> Result<ServerStats, Error> {
        let mut collected = ServerStats::default();

        for node in self.pool.working_nodes() {
            match Self::stats_from(&node, key) {
                Ok(stats) => collected.insert(node.endpoint(), stats),
                Err(e) => {
                    warn!(self.log, "stats request failed";
                          "endpoint" => %node.endpoint(),
                          "error" => %e);
                }
            }
        }

        Ok(collected)
    }

    fn stats_from(
        node: &Arc<Node>,
        key: Option<&str>,
    ) -> Result<HashMap<String, String>, Error> {
        let mut socket = node.acquire()?;
        ops::stats(&mut socket, key)
    }

    /// The version string of every working server.
    pub fn server_versions(
        &self,
    ) -> Result<HashMap<SocketAddr, String>, Error> {
        let mut versions = HashMap::new();

        for node in self.pool.working_nodes() {
            let mut socket = node.acquire()?;
            versions.insert(node.endpoint(), ops::version(&mut socket)?);
        }

        Ok(versions)
    }

    fn with_socket<T, F>(&self, key: &str, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut PooledSocket) -> Result<T, Error>,
    {
        let node = self.pool.locate(key).ok_or(Error::NoAvailableNodes)?;
        let mut socket = node.acquire()?;
        // errors flow out as-is; the socket's alive flag decides its fate
        // when the guard drops
        op(&mut socket)
    }
}
