// Copyright 2020 Joyent, Inc.

//! A memcached binary-protocol client
//!
//! carom maintains live TCP connections to a cluster of memcached servers,
//! routes each key deterministically to a server via consistent hashing,
//! pools and recycles sockets per server, detects and recovers from server
//! failures, and frames the binary request/response wire format (including
//! pipelined multi-key fetches and SASL authentication).
//!
//! ## Architecture
//!
//! The pieces compose bottom-up:
//!
//! * [`socket`] — one timeout-bounded TCP/TLS connection
//! * [`pool`] — a bounded, reusable set of live sockets for one server
//! * [`node`] — a server endpoint: its pool plus a failure policy deciding
//!   when the server is dead, and resurrection by wholesale pool
//!   replacement
//! * [`locator`] — the consistent-hash ring mapping keys onto the alive
//!   node set
//! * [`server_pool`] — cluster membership: composes the locator and the
//!   nodes, reacts to failure events, and runs the resurrection timer
//! * [`proto`] — the binary wire format and the operations executed against
//!   a routed node
//! * [`client`] — the operation surface (`get`, `set`, `cas`, `multi_get`,
//!   `stats`, ...) that higher layers consume
//!
//! A client operation asks the server pool to route its key to a node,
//! checks a pooled socket out of that node, writes the binary request,
//! parses the response, and releases the socket by dropping the guard.
//! Failures observed during I/O feed the node's failure policy, which may
//! mark the node dead, trigger a locator rebuild excluding it, and arm the
//! resurrection timer that probes dead nodes until they come back.
//!
//! ## Example
//!
//! ```rust,ignore
//! use carom::client::MemcachedClient;
//! use carom::config::ClientConfig;
//! use carom::transcoder::CacheItem;
//!
//! let config = ClientConfig::new(vec![
//!     "10.0.0.1:11211".parse().unwrap(),
//!     "10.0.0.2:11211".parse().unwrap(),
//! ]);
//! let client = MemcachedClient::new(config)?;
//!
//! client.set("greeting", &CacheItem::new(0, b"hello".to_vec()), 60)?;
//! if let Some(found) = client.get("greeting")? {
//!     println!("{:?}", found.item.data);
//! }
//! ```
//!
//! ## Failure handling
//!
//! Expected cache outcomes (miss, CAS mismatch, not-stored) come back in
//! typed operation results. Transport problems mark the affected socket
//! dead so the pool destroys it; enough of them in a short window mark the
//! whole node dead, which rebuilds the routing ring without it. A dead node
//! is probed periodically and rejoins the ring once it answers again.

#![allow(missing_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod failure;
pub mod locator;
pub mod node;
pub mod pool;
pub mod proto;
pub mod server_pool;
pub mod socket;
pub mod transcoder;
