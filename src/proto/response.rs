// Copyright 2020 Joyent, Inc.

//! Response frame parsing.

use super::header::{ResponseHeader, Status, HEADER_SIZE};
use crate::error::Error;
use crate::socket::PooledSocket;

/// One parsed response frame, its body already split into extras, key and
/// value sections per the declared lengths.
pub struct BinaryResponse {
    pub opcode: u8,
    pub status: u16,
    pub key: Vec<u8>,
    pub extra: Vec<u8>,
    pub data: Vec<u8>,
    pub cas: u64,
    pub correlation_id: u32,
}

impl BinaryResponse {
    /// Reads one complete frame from the socket. A frame that does not parse
    /// marks the socket dead: once the stream position is in doubt the
    /// connection cannot carry any further traffic.
    pub fn read(socket: &mut PooledSocket) -> Result<BinaryResponse, Error> {
        let mut header_buf = [0u8; HEADER_SIZE];
        socket.read_exact(&mut header_buf)?;

        let header = match ResponseHeader::parse(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                socket.mark_dead();
                return Err(e);
            }
        };

        let mut body = vec![0u8; header.total_body_length as usize];
        socket.read_exact(&mut body)?;

        let extras_end = header.extras_length as usize;
        let key_end = extras_end + header.key_length as usize;

        let data = body.split_off(key_end);
        let key = body.split_off(extras_end);
        let extra = body;

        Ok(BinaryResponse {
            opcode: header.opcode,
            status: header.status,
            key,
            extra,
            data,
            cas: header.cas,
            correlation_id: header.opaque,
        })
    }

    pub fn success(&self) -> bool {
        self.status == Status::NoError as u16
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_u16(self.status)
    }

    /// The human-readable error text servers put in the value section of
    /// failure responses.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// The flags stored alongside the item, carried in the extras of get
    /// responses.
    pub fn flags(&self) -> u32 {
        if self.extra.len() >= 4 {
            u32::from_be_bytes([
                self.extra[0],
                self.extra[1],
                self.extra[2],
                self.extra[3],
            ])
        } else {
            0
        }
    }
}
