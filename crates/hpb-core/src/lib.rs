#![forbid(unsafe_code)]
//! Host-side UFS HPB region cache engine.
//!
//! The device keeps its logical-to-physical mapping tables on-die; this
//! engine mirrors a working set of them on the host so that one-block
//! reads whose entry is known fresh can be rewritten into direct-physical
//! reads, skipping a translation step in the device.
//!
//! The embedding transport supplies two capabilities
//! ([`DescriptorSource`] and [`MapDownloader`]) and drives the engine
//! from exactly two places: [`HpbLu::prep`] before every read/write is
//! dispatched, and [`HpbLu::on_response`] on every command completion.
//! Everything else — activation, eviction, dirty tracking, map
//! downloads, retries, device resets — happens inside, and no internal
//! failure ever surfaces to the I/O caller: the worst case is a normal
//! logical read.

pub mod command;
pub mod device;
pub mod lu;
pub mod stats;
pub mod traits;

pub use command::{IoCommand, IoKind};
pub use hpb_cache::{EvictionPolicy, RegionState, SubregionState};
pub use device::{FeatureSupport, HpbDevice};
pub use lu::{HpbConfig, HpbLu, LuState};
pub use stats::StatsSnapshot;
pub use traits::{
    DescriptorSource, MapCompletion, MapDownloader, MapReadError, MapReadResult, MapRequest,
};
