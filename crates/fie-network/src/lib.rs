//! Address blocks, block allocation and static route planning for fie.
//!
//! Every emulated node owns one private address block. The
//! [`BlockAllocator`] hands them out, [`AddressBlock`] derives each node's
//! gateway, and [`RouteEntry`] describes the static routes that give the
//! nodes full-mesh reachability.

#![forbid(unsafe_code)]

pub mod allocation;
pub mod types;

pub use allocation::{AllocationError, BlockAllocator, PoolConfig, MAX_POOL_BLOCKS};
pub use types::{ordered_pairs, AddressBlock, RouteEntry};
