// Copyright 2020 Joyent, Inc.

//! The binary protocol operations, each executed against an already acquired
//! socket: build the request, write it, read and interpret the response.
//!
//! Protocol-level failures the caller is expected to handle (miss, CAS
//! mismatch, not-stored) come back inside the typed results; only transport
//! problems and statuses an operation cannot express are returned as errors.

use std::collections::HashMap;

use slog::warn;

use super::header::{Opcode, Status};
use super::request::BinaryRequest;
use super::response::BinaryResponse;
use crate::auth::AuthProvider;
use crate::error::Error;
use crate::socket::PooledSocket;
use crate::transcoder::CacheItem;

/// Which store command to issue. The modes map to distinct opcodes, so a
/// conflicting combination is unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// Store regardless of whether the key exists.
    Set,
    /// Store only if the key does not exist yet.
    Add,
    /// Store only if the key already exists.
    Replace,
}

/// Which end of an existing value to extend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcatMode {
    Append,
    Prepend,
}

/// Direction of a counter mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterMode {
    Increment,
    Decrement,
}

/// A fetched item together with the server's CAS token for it.
#[derive(Clone, Debug)]
pub struct GetResult {
    pub item: CacheItem,
    pub cas: u64,
}

/// Outcome of a store operation.
#[derive(Clone, Debug)]
pub struct StoreResult {
    pub success: bool,
    pub status: u16,
    pub cas: u64,
    pub message: Option<String>,
}

/// Outcome of a CAS-conditional operation: a single success flag plus the
/// current CAS token. Not-found, CAS mismatch and other server errors are
/// deliberately not distinguishable from this primitive alone.
#[derive(Clone, Copy, Debug)]
pub struct CasResult {
    pub success: bool,
    pub cas: u64,
}

/// Outcome of an increment or decrement.
#[derive(Clone, Debug)]
pub struct CounterResult {
    pub success: bool,
    pub status: u16,
    pub value: u64,
    pub cas: u64,
    pub message: Option<String>,
}

/// Outcome of a remove.
#[derive(Clone, Debug)]
pub struct OperationStatus {
    pub success: bool,
    pub status: u16,
    pub message: Option<String>,
}

fn read_matching(
    socket: &mut PooledSocket,
    request: &BinaryRequest,
) -> Result<BinaryResponse, Error> {
    let response = BinaryResponse::read(socket)?;
    if response.correlation_id != request.correlation_id() {
        socket.mark_dead();
        return Err(Error::Desynchronized(format!(
            "expected correlation id {}, found {}",
            request.correlation_id(),
            response.correlation_id
        )));
    }
    Ok(response)
}

/// Fetches one key. A miss is `Ok(None)`, not an error.
pub fn get(
    socket: &mut PooledSocket,
    key: &str,
) -> Result<Option<GetResult>, Error> {
    let mut request = BinaryRequest::new(Opcode::Get);
    request.key = key.as_bytes().to_vec();

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    if response.success() {
        let flags = response.flags();
        Ok(Some(GetResult {
            item: CacheItem::new(flags, response.data),
            cas: response.cas,
        }))
    } else if response.status == Status::KeyNotFound as u16 {
        Ok(None)
    } else {
        Err(Error::Server {
            status: response.status,
            message: response.message(),
        })
    }
}

/// Stores one item. `cas` of zero stores unconditionally; any other value
/// makes the store conditional on the server still holding that CAS.
pub fn store(
    socket: &mut PooledSocket,
    mode: StoreMode,
    key: &str,
    item: &CacheItem,
    expiration: u32,
    cas: u64,
) -> Result<StoreResult, Error> {
    let opcode = match mode {
        StoreMode::Set => Opcode::Set,
        StoreMode::Add => Opcode::Add,
        StoreMode::Replace => Opcode::Replace,
    };

    let mut extra = Vec::with_capacity(8);
    extra.extend_from_slice(&item.flags.to_be_bytes());
    extra.extend_from_slice(&expiration.to_be_bytes());

    let mut request = BinaryRequest::new(opcode);
    request.key = key.as_bytes().to_vec();
    request.extra = extra;
    request.data = item.data.clone();
    request.cas = cas;

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    Ok(StoreResult {
        success: response.success(),
        status: response.status,
        cas: response.cas,
        message: if response.success() {
            None
        } else {
            Some(response.message())
        },
    })
}

/// Removes one key.
pub fn delete(
    socket: &mut PooledSocket,
    key: &str,
) -> Result<OperationStatus, Error> {
    let mut request = BinaryRequest::new(Opcode::Delete);
    request.key = key.as_bytes().to_vec();

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    Ok(OperationStatus {
        success: response.success(),
        status: response.status,
        message: if response.success() {
            None
        } else {
            Some(response.message())
        },
    })
}

/// Appends or prepends to an existing value, optionally conditional on a
/// CAS token.
pub fn concat(
    socket: &mut PooledSocket,
    mode: ConcatMode,
    key: &str,
    data: &[u8],
    cas: u64,
) -> Result<CasResult, Error> {
    let opcode = match mode {
        ConcatMode::Append => Opcode::Append,
        ConcatMode::Prepend => Opcode::Prepend,
    };

    let mut request = BinaryRequest::new(opcode);
    request.key = key.as_bytes().to_vec();
    request.data = data.to_vec();
    request.cas = cas;

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    Ok(CasResult {
        success: response.success(),
        cas: response.cas,
    })
}

/// Increments or decrements a numeric value, creating it at `initial` when
/// absent.
pub fn counter(
    socket: &mut PooledSocket,
    mode: CounterMode,
    key: &str,
    delta: u64,
    initial: u64,
    expiration: u32,
) -> Result<CounterResult, Error> {
    let opcode = match mode {
        CounterMode::Increment => Opcode::Increment,
        CounterMode::Decrement => Opcode::Decrement,
    };

    let mut extra = Vec::with_capacity(20);
    extra.extend_from_slice(&delta.to_be_bytes());
    extra.extend_from_slice(&initial.to_be_bytes());
    extra.extend_from_slice(&expiration.to_be_bytes());

    let mut request = BinaryRequest::new(opcode);
    request.key = key.as_bytes().to_vec();
    request.extra = extra;

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    if response.success() {
        if response.data.len() != 8 {
            socket.mark_dead();
            return Err(Error::Desynchronized(format!(
                "counter response carried {} value bytes, expected 8",
                response.data.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&response.data);
        Ok(CounterResult {
            success: true,
            status: response.status,
            value: u64::from_be_bytes(buf),
            cas: response.cas,
            message: None,
        })
    } else {
        Ok(CounterResult {
            success: false,
            status: response.status,
            value: 0,
            cas: 0,
            message: Some(response.message()),
        })
    }
}

/// Fetches many keys over one connection by pipelining one quiet get per key
/// followed by a terminating no-op. Quiet gets produce no frame on a miss,
/// so the result map simply lacks those keys. Responses are matched to keys
/// by correlation id; the read loop ends when the no-op's id comes back. If
/// the stream ends before that, the connection is desynchronized and the
/// error propagates (the socket is already marked dead by the failed read).
pub fn multi_get(
    socket: &mut PooledSocket,
    keys: &[&str],
) -> Result<HashMap<String, GetResult>, Error> {
    let mut results = HashMap::with_capacity(keys.len());
    if keys.is_empty() {
        return Ok(results);
    }

    let mut buffer = Vec::with_capacity(keys.len() * 40);
    let mut id_to_key = HashMap::with_capacity(keys.len());

    for key in keys {
        let mut request = BinaryRequest::new(Opcode::GetQ);
        request.key = key.as_bytes().to_vec();
        request.write_to(&mut buffer);
        id_to_key.insert(request.correlation_id(), (*key).to_string());
    }

    // the no-op uncorks the quiet gets and marks the end of the batch
    let noop = BinaryRequest::new(Opcode::NoOp);
    noop.write_to(&mut buffer);

    socket.write(&buffer)?;

    loop {
        let response = BinaryResponse::read(socket)?;

        if response.correlation_id == noop.correlation_id() {
            return Ok(results);
        }

        match id_to_key.get(&response.correlation_id) {
            Some(key) => {
                if response.success() {
                    let flags = response.flags();
                    results.insert(
                        key.clone(),
                        GetResult {
                            item: CacheItem::new(flags, response.data),
                            cas: response.cas,
                        },
                    );
                }
            }
            None => {
                warn!(socket.log(),
                      "response matches no pipelined request";
                      "correlation_id" => response.correlation_id);
            }
        }
    }
}

/// Requests the server's statistics. The server streams key/value frames
/// and terminates the listing with an empty frame.
pub fn stats(
    socket: &mut PooledSocket,
    key: Option<&str>,
) -> Result<HashMap<String, String>, Error> {
    let mut request = BinaryRequest::new(Opcode::Stat);
    if let Some(key) = key {
        request.key = key.as_bytes().to_vec();
    }

    socket.write(&request.to_bytes())?;

    let mut results = HashMap::new();
    loop {
        let response = read_matching(socket, &request)?;

        if !response.success() {
            return Err(Error::Server {
                status: response.status,
                message: response.message(),
            });
        }

        if response.key.is_empty() && response.data.is_empty() {
            return Ok(results);
        }

        results.insert(
            String::from_utf8_lossy(&response.key).into_owned(),
            String::from_utf8_lossy(&response.data).into_owned(),
        );
    }
}

/// Asks the server for its version string.
pub fn version(socket: &mut PooledSocket) -> Result<String, Error> {
    let request = BinaryRequest::new(Opcode::Version);

    socket.write(&request.to_bytes())?;
    let response = read_matching(socket, &request)?;

    if response.success() {
        Ok(String::from_utf8_lossy(&response.data).into_owned())
    } else {
        Err(Error::Server {
            status: response.status,
            message: response.message(),
        })
    }
}

/// Runs the SASL handshake on a freshly connected socket. On any outcome
/// other than success the socket must not enter the pool; the caller drops
/// it and the creation attempt fails.
pub fn authenticate(
    socket: &mut PooledSocket,
    provider: &dyn AuthProvider,
) -> Result<(), Error> {
    let mut request = BinaryRequest::new(Opcode::SaslAuth);
    request.key = provider.mechanism().as_bytes().to_vec();
    request.data = provider.start();

    socket.write(&request.to_bytes())?;

    loop {
        let response = BinaryResponse::read(socket)?;

        if response.success() {
            return Ok(());
        }

        if response.status == Status::AuthContinue as u16 {
            // challenge-response continuation
            let mut step = BinaryRequest::new(Opcode::SaslStep);
            step.key = provider.mechanism().as_bytes().to_vec();
            step.data = provider.step(&response.data);
            socket.write(&step.to_bytes())?;
        } else {
            return Err(Error::AuthenticationFailed(
                socket.endpoint(),
                format!("server returned status {:#06x}", response.status),
            ));
        }
    }
}
