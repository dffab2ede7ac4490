//! `Redis` adapters for Matchup.
//!
//! - [`RedisSpatialIndex`]: proximity index on a GEO sorted set
//! - [`RedisLock`]: `SET NX PX` lease with token-checked release
//!
//! Both use a `ConnectionManager`, which reconnects transparently and is cheap
//! to clone per call.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod lock;
mod spatial_index;

pub use lock::RedisLock;
pub use spatial_index::{DEFAULT_GEO_KEY, RedisSpatialIndex};
