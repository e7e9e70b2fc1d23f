#![forbid(unsafe_code)]
//! External collaborator interfaces.
//!
//! The engine is a policy layer over the UFS command layer: descriptor
//! reads at attach time and asynchronous map downloads afterwards are both
//! supplied by the embedding transport through these traits. The core
//! never touches a bus.

use hpb_desc::DescriptorId;
use hpb_error::Result;
use hpb_types::{LunId, RegionId, SubregionId};

/// Synchronous descriptor access, used only during attach.
pub trait DescriptorSource: Send + Sync {
    /// Read the raw bytes of one descriptor. `index` selects the unit for
    /// [`DescriptorId::Unit`] and is ignored otherwise.
    fn read_descriptor(&self, id: DescriptorId, index: u8) -> Result<Vec<u8>>;
}

/// One in-flight "download the map table for subregion X" command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub lun: LunId,
    pub region: RegionId,
    pub subregion: SubregionId,
    /// Expected transfer length in bytes.
    pub len: u32,
    /// Resubmission count, bumped by the retry worker.
    pub retries: u8,
}

/// Failure classification for a map download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapReadError {
    /// The device no longer recognizes the region as active.
    ///
    /// For pinned regions this drives the bounded retry path; for ordinary
    /// regions the engine self-heals by synthesizing an inactive
    /// notification.
    RegionNotRecognized,
    /// Any other device or transport failure; recorded as a statistic only.
    Device(String),
}

/// Outcome delivered to a map-read completion: the raw big-endian entry
/// payload on success.
pub type MapReadResult = std::result::Result<Vec<u8>, MapReadError>;

/// Completion callback for one map read.
///
/// Invoked from the transport's own completion context; implementations on
/// the engine side only take short-hold locks and never block.
pub type MapCompletion = Box<dyn FnOnce(MapReadResult) + Send>;

/// Asynchronous map-download submission.
///
/// `submit_map_read` must be callable from the scheduler worker without
/// blocking on the device: fire-and-forget, with the outcome delivered
/// later through `complete`.
pub trait MapDownloader: Send + Sync {
    fn submit_map_read(&self, request: MapRequest, complete: MapCompletion);
}
