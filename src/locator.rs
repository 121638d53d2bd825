// Copyright 2020 Joyent, Inc.

//! Key→node routing.
//!
//! The default locator is a consistent-hash ring: every node is inserted at
//! `server_address_mutations` positions derived from FNV-1a hashes of its
//! address string, and a key is owned by the node at the smallest ring
//! position at or above the key's own hash, wrapping around at the top. For
//! a fixed node set the routing is deterministic and reproducible;
//! membership changes always rebuild the whole ring, never mutate it in
//! place.

use std::sync::Arc;

use derive_more::{Display, From, Into};

use crate::node::Node;

const FNV1A_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV1A_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(FNV1A_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV1A_PRIME)
    })
}

/// A position on the hash ring.
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Into, Ord, PartialOrd, PartialEq,
)]
pub struct RingPosition(u32);

/// Routes keys to nodes. Implementations are built from a fixed alive-node
/// list and are immutable afterwards; the server pool swaps whole locator
/// values on membership changes.
pub trait NodeLocator: Send + Sync {
    /// The node owning `key`, or `None` when no node is available.
    fn locate(&self, key: &str) -> Option<Arc<Node>>;

    /// The nodes backing the current routing state.
    fn working_nodes(&self) -> Vec<Arc<Node>>;
}

/// The consistent-hash ring locator.
pub struct RingLocator {
    // sorted by position; the owner is an index into `nodes`
    ring: Vec<(RingPosition, usize)>,
    nodes: Vec<Arc<Node>>,
}

impl RingLocator {
    pub fn new(nodes: Vec<Arc<Node>>, mutations: u32) -> Self {
        let mut ring = Vec::with_capacity(nodes.len() * mutations as usize);

        for (owner, node) in nodes.iter().enumerate() {
            let address = node.endpoint().to_string();
            for mutation in 0..mutations {
                let position =
                    fnv1a(format!("{}-{}", address, mutation).as_bytes());
                ring.push((RingPosition::from(position), owner));
            }
        }

        // stable sort plus dedup keeps the first writer of a colliding
        // position, so the ring is deterministic for a fixed input order
        ring.sort_by_key(|entry| entry.0);
        ring.dedup_by_key(|entry| entry.0);

        RingLocator { ring, nodes }
    }
}

impl NodeLocator for RingLocator {
    fn locate(&self, key: &str) -> Option<Arc<Node>> {
        if self.ring.is_empty() {
            return None;
        }

        let hash = RingPosition::from(fnv1a(key.as_bytes()));
        let index = match self.ring.binary_search_by_key(&hash, |entry| entry.0)
        {
            Ok(index) => index,
            Err(index) => {
                if index == self.ring.len() {
                    0
                } else {
                    index
                }
            }
        };

        Some(Arc::clone(&self.nodes[self.ring[index].1]))
    }

    fn working_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.clone()
    }
}

/// The degenerate locator for a cluster of exactly one configured server:
/// every key maps to the sole node, no ring is built.
pub struct SingleNodeLocator {
    node: Option<Arc<Node>>,
}

impl SingleNodeLocator {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        SingleNodeLocator {
            node: nodes.into_iter().next(),
        }
    }
}

impl NodeLocator for SingleNodeLocator {
    fn locate(&self, _key: &str) -> Option<Arc<Node>> {
        self.node.clone()
    }

    fn working_nodes(&self) -> Vec<Arc<Node>> {
        self.node.iter().cloned().collect()
    }
}
