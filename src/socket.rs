// Copyright 2020 Joyent, Inc.

//! The low-level socket primitive held by the pools.
//!
//! A [`PooledSocket`] is one live TCP (optionally TLS) connection bound to a
//! single node. Every read and write is bounded by the configured receive
//! timeout, and any I/O failure flips the socket's alive flag off so the
//! owning pool destroys it instead of reusing it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use native_tls::{TlsConnector, TlsStream};
use slog::{debug, warn, Logger};
use uuid::Uuid;

use crate::config::TlsOptions;
use crate::error::Error;

enum Transport {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

/// One live connection to a memcached server.
pub struct PooledSocket {
    transport: Transport,
    endpoint: SocketAddr,
    alive: bool,
    last_used: Instant,
    instance_id: Uuid,
    log: Logger,
}

impl PooledSocket {
    /// Establishes a connection to `endpoint`, failing if it does not
    /// complete within `connect_timeout`. On timeout the in-flight attempt
    /// is torn down rather than left to finish in the background.
    pub fn connect(
        endpoint: SocketAddr,
        connect_timeout: Duration,
        receive_timeout: Duration,
        tls: Option<&TlsOptions>,
        log: &Logger,
    ) -> Result<PooledSocket, Error> {
        let stream = TcpStream::connect_timeout(&endpoint, connect_timeout)
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    Error::ConnectTimeout(endpoint)
                }
                _ => Error::Io(e),
            })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(receive_timeout))?;
        stream.set_write_timeout(Some(receive_timeout))?;

        let transport = match tls {
            Some(options) => {
                let mut builder = TlsConnector::builder();
                if options.accept_invalid_certs {
                    builder.danger_accept_invalid_certs(true);
                }
                let connector =
                    builder.build().map_err(|e| Error::Tls(e.to_string()))?;
                let stream = connector
                    .connect(&options.domain, stream)
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Transport::Tls(stream)
            }
            None => Transport::Plain(stream),
        };

        let instance_id = Uuid::new_v4();
        debug!(log, "socket connected";
               "endpoint" => %endpoint,
               "instance_id" => %instance_id);

        Ok(PooledSocket {
            transport,
            endpoint,
            alive: true,
            last_used: Instant::now(),
            instance_id,
            log: log.clone(),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Whether the last I/O on this socket succeeded. A socket that reports
    /// not-alive must be destroyed, never returned to the pool.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub(crate) fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// Opaque identity of this connection, for diagnostics.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Reads exactly `buf.len()` bytes, looping over partial reads. Fails if
    /// the peer closes early or the receive timeout elapses.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match self.transport.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.alive = false;
                Err(Error::Io(e))
            }
        }
    }

    /// Writes `buf` as a single logical send, flushing any TLS buffering.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.write_segments(&[buf])
    }

    /// Writes several byte ranges as one logical send.
    pub fn write_segments(&mut self, segments: &[&[u8]]) -> Result<(), Error> {
        match self.write_inner(segments) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.alive = false;
                Err(Error::Io(e))
            }
        }
    }

    fn write_inner(&mut self, segments: &[&[u8]]) -> io::Result<()> {
        for segment in segments {
            self.transport.write_all(segment)?;
        }
        self.transport.flush()
    }

    /// Drains any unexpected already-buffered bytes before the socket is
    /// reused. Leftover bytes mean a previous operation did not consume its
    /// whole response, which would desynchronize the next one.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.transport.tcp().set_nonblocking(true)?;

        let mut drained = 0usize;
        let mut scratch = [0u8; 512];
        let outcome = loop {
            match self.transport.read(&mut scratch) {
                // EOF while idle: the peer closed on us
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => drained += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    break Ok(())
                }
                Err(e) => break Err(e),
            }
        };

        let restore = self.transport.tcp().set_nonblocking(false);

        if drained > 0 {
            warn!(self.log,
                  "socket had unread data before reuse, this is probably a bug";
                  "bytes" => drained,
                  "endpoint" => %self.endpoint,
                  "instance_id" => %self.instance_id);
        }

        match outcome.and(restore) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.alive = false;
                Err(Error::Io(e))
            }
        }
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        // closing is deterministic: dropping the transport shuts the stream
        debug!(self.log, "socket closed";
               "endpoint" => %self.endpoint,
               "instance_id" => %self.instance_id);
    }
}
