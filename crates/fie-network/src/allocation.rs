//! Address block allocation for fie nodes.
//!
//! A private address space is partitioned into fixed-size blocks and each
//! node receives exactly one of them.
//!
//! # Block Scheme
//!
//! ```text
//! 192.168.0.0/16      - pool base
//! 192.168.11.0/24     - block 0 (first_subnet = 11)
//! 192.168.12.0/24     - block 1
//! ...
//! 192.168.{11+i}.0/24 - block i
//! ```
//!
//! Blocks are claimed when a node is constructed and only go back to the
//! pool when the whole orchestrator tears down.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::AddressBlock;

/// Hard ceiling on the number of blocks a pool may hold.
pub const MAX_POOL_BLOCKS: usize = 200;

/// Errors that can occur during block allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Every block in the pool has been assigned.
    #[error("address pool exhausted: all {capacity} blocks are assigned")]
    Exhausted {
        /// Number of blocks in the pool.
        capacity: usize,
    },
    /// The requested pool is larger than the hard ceiling.
    #[error("pool of {requested} blocks exceeds the limit of {limit}")]
    PoolTooLarge {
        /// Number of blocks requested.
        requested: usize,
        /// The ceiling.
        limit: usize,
    },
    /// The pool layout does not fit inside the base network.
    #[error("invalid pool layout: {message}")]
    InvalidLayout {
        /// Description of the error.
        message: String,
    },
    /// A block handed back was never part of this pool.
    #[error("block {block} is not part of the pool")]
    NotInPool {
        /// The foreign block.
        block: AddressBlock,
    },
}

/// Layout of an address pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Private network the blocks are carved from.
    pub base: Ipv4Net,
    /// Subnet number of block 0 inside `base`.
    pub first_subnet: u32,
    /// Prefix length of every block.
    pub block_prefix: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Net::new(Ipv4Addr::new(192, 168, 0, 0), 16).unwrap_or_default(),
            first_subnet: 11,
            block_prefix: 24,
        }
    }
}

impl PoolConfig {
    /// Computes the `index`-th block of this layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the block would fall outside `base`.
    pub fn block_at(&self, index: usize) -> Result<AddressBlock, AllocationError> {
        if self.block_prefix < self.base.prefix_len() || self.block_prefix > 30 {
            return Err(AllocationError::InvalidLayout {
                message: format!(
                    "block prefix /{} must lie between /{} and /30",
                    self.block_prefix,
                    self.base.prefix_len()
                ),
            });
        }

        let subnet_bits = u32::from(self.block_prefix - self.base.prefix_len());
        let subnet_count = 1u64 << subnet_bits;
        let subnet = u64::from(self.first_subnet) + index as u64;
        if subnet >= subnet_count {
            return Err(AllocationError::InvalidLayout {
                message: format!(
                    "block {index} (subnet {subnet}) does not fit in {} with /{} blocks",
                    self.base, self.block_prefix
                ),
            });
        }

        let host_bits = 32 - u32::from(self.block_prefix);
        let network = u32::from(self.base.network()) | ((subnet as u32) << host_bits);
        Ipv4Net::new(Ipv4Addr::from(network), self.block_prefix)
            .map(AddressBlock::new)
            .map_err(|e| AllocationError::InvalidLayout {
                message: format!("failed to build block {index}: {e}"),
            })
    }
}

#[derive(Debug)]
struct PoolState {
    used: Vec<bool>,
}

/// Ordered pool of disjoint address blocks with a used/free marker per block.
///
/// `assign` scans the markers in index order and claims the first free
/// block. The scan and the mark happen under one lock.
#[derive(Debug)]
pub struct BlockAllocator {
    blocks: Vec<AddressBlock>,
    state: Mutex<PoolState>,
}

impl BlockAllocator {
    /// Creates a pool of `size` blocks with the default layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` exceeds [`MAX_POOL_BLOCKS`].
    pub fn new(size: usize) -> Result<Self, AllocationError> {
        Self::with_config(&PoolConfig::default(), size)
    }

    /// Creates a pool of `size` blocks with a custom layout.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` exceeds [`MAX_POOL_BLOCKS`] or the layout
    /// cannot hold `size` blocks.
    pub fn with_config(config: &PoolConfig, size: usize) -> Result<Self, AllocationError> {
        if size > MAX_POOL_BLOCKS {
            return Err(AllocationError::PoolTooLarge {
                requested: size,
                limit: MAX_POOL_BLOCKS,
            });
        }

        let blocks = (0..size)
            .map(|i| config.block_at(i))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(size, base = %config.base, "created address pool");

        Ok(Self {
            blocks,
            state: Mutex::new(PoolState {
                used: vec![false; size],
            }),
        })
    }

    /// Claims the first free block.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Exhausted`] once every block is in use.
    pub fn assign(&self) -> Result<AddressBlock, AllocationError> {
        let mut state = self.state.lock();

        let index = state
            .used
            .iter()
            .position(|used| !used)
            .ok_or(AllocationError::Exhausted {
                capacity: self.blocks.len(),
            })?;

        state.used[index] = true;
        let block = self.blocks[index];
        debug!(index, %block, "assigned address block");
        Ok(block)
    }

    /// Returns a block to the pool.
    ///
    /// Only used when the owning orchestrator tears down.
    ///
    /// # Errors
    ///
    /// Returns an error if the block does not belong to this pool.
    pub fn release(&self, block: AddressBlock) -> Result<(), AllocationError> {
        let index = self
            .blocks
            .iter()
            .position(|b| *b == block)
            .ok_or(AllocationError::NotInPool { block })?;

        self.state.lock().used[index] = false;
        Ok(())
    }

    /// Total number of blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks not yet assigned.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().used.iter().filter(|used| !**used).count()
    }

    /// Checks whether a block is currently assigned.
    #[must_use]
    pub fn is_assigned(&self, block: AddressBlock) -> bool {
        self.blocks
            .iter()
            .position(|b| *b == block)
            .is_some_and(|i| self.state.lock().used[i])
    }

    /// All blocks in pool order, assigned or not.
    #[must_use]
    pub fn blocks(&self) -> &[AddressBlock] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn block(s: &str) -> AddressBlock {
        s.parse().expect("valid block")
    }

    // ==================== ASSIGNMENT TESTS ====================

    #[test]
    fn test_three_blocks_assigned_in_order_then_exhausted() {
        let pool = BlockAllocator::new(3).expect("should create pool");

        assert_eq!(pool.assign(), Ok(block("192.168.11.0/24")));
        assert_eq!(pool.assign(), Ok(block("192.168.12.0/24")));
        assert_eq!(pool.assign(), Ok(block("192.168.13.0/24")));
        assert_eq!(pool.assign(), Err(AllocationError::Exhausted { capacity: 3 }));
    }

    #[test]
    fn test_empty_pool_is_immediately_exhausted() {
        let pool = BlockAllocator::new(0).expect("should create pool");
        assert!(matches!(pool.assign(), Err(AllocationError::Exhausted { .. })));
    }

    #[test]
    fn test_available_tracks_assignments() {
        let pool = BlockAllocator::new(4).expect("should create pool");
        assert_eq!(pool.available(), 4);

        let b = pool.assign().expect("should assign");
        pool.assign().expect("should assign");

        assert_eq!(pool.available(), 2);
        assert!(pool.is_assigned(b));
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_release_makes_block_reassignable() {
        let pool = BlockAllocator::new(2).expect("should create pool");
        let first = pool.assign().expect("should assign");
        pool.assign().expect("should assign");

        pool.release(first).expect("should release");
        assert!(!pool.is_assigned(first));
        assert_eq!(pool.assign(), Ok(first));
    }

    #[test]
    fn test_release_foreign_block_fails() {
        let pool = BlockAllocator::new(2).expect("should create pool");
        let result = pool.release(block("10.0.0.0/24"));
        assert!(matches!(result, Err(AllocationError::NotInPool { .. })));
    }

    // ==================== CEILING TESTS ====================

    #[test]
    fn test_pool_at_ceiling_is_accepted() {
        let pool = BlockAllocator::new(MAX_POOL_BLOCKS);
        assert!(pool.is_ok());
    }

    #[test]
    fn test_pool_over_ceiling_fails_at_construction() {
        let result = BlockAllocator::new(MAX_POOL_BLOCKS + 1);
        assert_eq!(
            result.err(),
            Some(AllocationError::PoolTooLarge {
                requested: 201,
                limit: 200
            })
        );
    }

    #[test]
    fn test_layout_overflow_is_rejected() {
        let config = PoolConfig {
            first_subnet: 250,
            ..PoolConfig::default()
        };
        let result = BlockAllocator::with_config(&config, 10);
        assert!(matches!(result, Err(AllocationError::InvalidLayout { .. })));
    }

    #[test]
    fn test_custom_layout() {
        let config = PoolConfig {
            base: "10.50.0.0/16".parse().expect("valid net"),
            first_subnet: 0,
            block_prefix: 26,
        };
        let pool = BlockAllocator::with_config(&config, 3).expect("should create pool");
        assert_eq!(pool.assign(), Ok(block("10.50.0.0/26")));
        assert_eq!(pool.assign(), Ok(block("10.50.0.64/26")));
        assert_eq!(pool.assign(), Ok(block("10.50.0.128/26")));
    }

    #[test]
    fn test_block_prefix_shorter_than_base_is_rejected() {
        let config = PoolConfig {
            block_prefix: 8,
            ..PoolConfig::default()
        };
        assert!(config.block_at(0).is_err());
    }

    proptest! {
        #[test]
        fn prop_assigned_blocks_are_pairwise_disjoint(n in 0usize..=MAX_POOL_BLOCKS) {
            let pool = BlockAllocator::new(n).expect("should create pool");
            let blocks: Vec<_> = (0..n).map(|_| pool.assign().expect("should assign")).collect();

            for (i, a) in blocks.iter().enumerate() {
                for b in &blocks[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{a} overlaps {b}");
                }
            }
            let exhausted = matches!(pool.assign(), Err(AllocationError::Exhausted { .. }));
            prop_assert!(exhausted);
        }
    }
}
