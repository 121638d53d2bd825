// Copyright 2020 Joyent, Inc.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// The errors surfaced by this crate.
///
/// Transport problems (`Io`, `ConnectTimeout`, `Tls`) mark the affected
/// socket as dead; pool admission problems (`PoolDead`, `PoolExhausted`,
/// `CreateFailed`) describe why no socket could be handed out. Protocol-level
/// outcomes that a caller is expected to handle (cache miss, CAS mismatch,
/// not-stored) are carried in typed operation results instead and never show
/// up here.
#[derive(Debug, Error)]
pub enum Error {
    /// A TCP connection could not be established within the configured
    /// connect timeout. The connection attempt is torn down, not left to
    /// complete in the background.
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The node's socket pool has been marked dead and is not handing out
    /// sockets until the node is resurrected.
    #[error("socket pool for {0} is dead")]
    PoolDead(SocketAddr),

    /// All pool permits stayed claimed for the whole queue timeout.
    #[error("no pooled socket for {0} became available within the queue timeout")]
    PoolExhausted(SocketAddr),

    /// Connecting (or authenticating) a fresh socket failed.
    #[error("could not create a socket for {0}: {1}")]
    CreateFailed(SocketAddr, Box<Error>),

    /// The SASL handshake was rejected. The socket never entered the pool.
    #[error("authentication failed for {0}: {1}")]
    AuthenticationFailed(SocketAddr, String),

    /// The response stream no longer lines up with what was requested, e.g.
    /// a frame with a bad magic byte or a pipelined read that ended without
    /// its terminating no-op. The connection must be discarded.
    #[error("response stream desynchronized: {0}")]
    Desynchronized(String),

    /// The server answered with a status code the operation cannot express
    /// in its typed result.
    #[error("server error (status {status:#06x}): {message}")]
    Server { status: u16, message: String },

    /// Every configured node is currently dead.
    #[error("no memcached nodes are available")]
    NoAvailableNodes,

    #[error("value transcoding failed: {0}")]
    Transcode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
