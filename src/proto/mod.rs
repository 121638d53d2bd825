// Copyright 2020 Joyent, Inc.

//! The memcached binary protocol.
//!
//! Requests and responses share a fixed 24-byte header followed by extras,
//! key and value sections whose lengths the header declares. The layout is a
//! fixed compatibility target: it must byte-match what live memcached
//! servers speak.

pub mod header;
pub mod ops;
pub mod request;
pub mod response;
