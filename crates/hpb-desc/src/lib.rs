#![forbid(unsafe_code)]
//! Wire-format parsing for the HPB engine.
//!
//! Pure parsing crate — no I/O, no side effects. Parses byte slices into
//! typed structures: the device / geometry / unit descriptors consumed once
//! at attach time, and the HPB sense segment piggy-backed on response UPIUs
//! that carries device activation hints.

pub mod descriptors;
pub mod notice;

pub use descriptors::{
    DescriptorId, DeviceDescriptor, GeometryDescriptor, UnitDescriptor, parse_device_descriptor,
    parse_geometry_descriptor, parse_unit_descriptor,
};
pub use notice::{DeviceNotice, NoticeDecode, RegionUpdate, decode_notice};
