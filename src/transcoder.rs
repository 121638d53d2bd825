// Copyright 2020 Joyent, Inc.

//! The value codec seam.
//!
//! The client core moves opaque byte payloads tagged with a 32-bit flags
//! word; converting application values to and from that shape is the job of
//! a [`Transcoder`]. The codec is chosen statically at the call site by the
//! value's type, with one flag tag per primitive kind. Structured data is
//! left to implementors of the trait.

use crate::error::Error;

/// Flag tag for raw byte payloads.
pub const FLAG_BYTES: u32 = 0x0000;
/// Flag tag for UTF-8 string payloads.
pub const FLAG_STRING: u32 = 0x0001;
/// Flag tag for unsigned 64-bit integers, stored big-endian.
pub const FLAG_U64: u32 = 0x0002;

/// An item as it travels over the wire: a flags word describing the payload
/// plus the payload bytes themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheItem {
    pub flags: u32,
    pub data: Vec<u8>,
}

impl CacheItem {
    pub fn new(flags: u32, data: Vec<u8>) -> Self {
        CacheItem { flags, data }
    }
}

/// Converts values of one static type to and from cache items.
pub trait Transcoder<T> {
    fn serialize(&self, value: &T) -> Result<CacheItem, Error>;
    fn deserialize(&self, item: &CacheItem) -> Result<T, Error>;
}

/// The stock codec for byte, string and integer payloads.
pub struct DefaultTranscoder;

impl Transcoder<Vec<u8>> for DefaultTranscoder {
    fn serialize(&self, value: &Vec<u8>) -> Result<CacheItem, Error> {
        Ok(CacheItem::new(FLAG_BYTES, value.clone()))
    }

    fn deserialize(&self, item: &CacheItem) -> Result<Vec<u8>, Error> {
        Ok(item.data.clone())
    }
}

impl Transcoder<String> for DefaultTranscoder {
    fn serialize(&self, value: &String) -> Result<CacheItem, Error> {
        Ok(CacheItem::new(FLAG_STRING, value.as_bytes().to_vec()))
    }

    fn deserialize(&self, item: &CacheItem) -> Result<String, Error> {
        if item.flags != FLAG_STRING {
            return Err(Error::Transcode(format!(
                "expected string flags {:#06x}, found {:#06x}",
                FLAG_STRING, item.flags
            )));
        }
        String::from_utf8(item.data.clone())
            .map_err(|e| Error::Transcode(e.to_string()))
    }
}

impl Transcoder<u64> for DefaultTranscoder {
    fn serialize(&self, value: &u64) -> Result<CacheItem, Error> {
        Ok(CacheItem::new(FLAG_U64, value.to_be_bytes().to_vec()))
    }

    fn deserialize(&self, item: &CacheItem) -> Result<u64, Error> {
        if item.flags != FLAG_U64 {
            return Err(Error::Transcode(format!(
                "expected integer flags {:#06x}, found {:#06x}",
                FLAG_U64, item.flags
            )));
        }
        if item.data.len() != 8 {
            return Err(Error::Transcode(format!(
                "integer payload has {} bytes, expected 8",
                item.data.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&item.data);
        Ok(u64::from_be_bytes(buf))
    }
}
