#![forbid(unsafe_code)]
//! Region cache data model.
//!
//! Pure data structures with no locking of their own: the owning LU context
//! wraps the [`RegionTable`] in its single cache mutex and every method here
//! is called with that lock held. Nothing in this crate blocks or
//! allocates after construction — the map-buffer pool, the region array,
//! and every dirty bitmap are sized once from [`hpb_types::LuGeometry`].

pub mod bitmap;
pub mod pool;
pub mod table;

pub use bitmap::DirtyBitmap;
pub use pool::{MctxId, MctxPool};
pub use table::{
    CacheError, EvictionPolicy, Lookup, RegionState, RegionTable, SubregionState,
};
