// Copyright 2020 Joyent, Inc.

//! Request framing.

use std::sync::atomic::{AtomicU32, Ordering};

use super::header::{Opcode, RequestHeader, HEADER_SIZE};

// Correlation ids are unique per in-flight request on a connection; a
// process-wide counter satisfies that trivially.
static CORRELATION: AtomicU32 = AtomicU32::new(1);

fn next_correlation_id() -> u32 {
    CORRELATION.fetch_add(1, Ordering::Relaxed)
}

/// One outgoing request: opcode, optional extras/key/value sections, a CAS
/// value, and a locally generated correlation id that the server echoes back
/// in the matching response.
pub struct BinaryRequest {
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub extra: Vec<u8>,
    pub data: Vec<u8>,
    pub cas: u64,
    correlation_id: u32,
}

impl BinaryRequest {
    pub fn new(opcode: Opcode) -> Self {
        BinaryRequest {
            opcode,
            key: Vec::new(),
            extra: Vec::new(),
            data: Vec::new(),
            cas: 0,
            correlation_id: next_correlation_id(),
        }
    }

    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }

    /// Appends the framed request to `out`. Pipelined operations call this
    /// repeatedly to build one combined send.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut header = RequestHeader::new(self.opcode);
        header.key_length = self.key.len() as u16;
        header.extras_length = self.extra.len() as u8;
        header.total_body_length =
            (self.extra.len() + self.key.len() + self.data.len()) as u32;
        header.opaque = self.correlation_id;
        header.cas = self.cas;

        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.extra.len() + self.key.len() + self.data.len(),
        );
        self.write_to(&mut out);
        out
    }
}
