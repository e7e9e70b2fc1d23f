#![forbid(unsafe_code)]
//! Device, geometry, and unit descriptor parsing.
//!
//! Only the HPB-relevant fields are decoded. All multi-byte integers are
//! big-endian on the wire; the engine converts once here and never re-parses
//! descriptor bytes after attach.

use hpb_types::{ParseError, read_be_u16, read_be_u32, read_be_u64, read_u8};
use serde::{Deserialize, Serialize};

/// Descriptor identification values (bDescriptorIDN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DescriptorId {
    Device = 0x00,
    Unit = 0x02,
    Geometry = 0x07,
}

impl DescriptorId {
    #[must_use]
    pub fn idn(self) -> u8 {
        self as u8
    }
}

// ── Device descriptor ──────────────────────────────────────────────────────

const DEVICE_DESC_IDN_OFFSET: usize = 0x01;
/// dExtendedUFSFeaturesSupport (u32).
const DEVICE_DESC_EXT_FEATURES_OFFSET: usize = 0x4F;
/// wHPBVersion (u16).
const DEVICE_DESC_HPB_VERSION_OFFSET: usize = 0x53;
/// HPB bit within dExtendedUFSFeaturesSupport.
const EXT_FEATURE_HPB: u32 = 1 << 7;

/// HPB-relevant fields of the device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub hpb_supported: bool,
    pub hpb_version: u16,
}

pub fn parse_device_descriptor(data: &[u8]) -> Result<DeviceDescriptor, ParseError> {
    let idn = read_u8(data, DEVICE_DESC_IDN_OFFSET)?;
    if idn != DescriptorId::Device.idn() {
        return Err(ParseError::InvalidField {
            field: "bDescriptorIDN",
            reason: "not a device descriptor",
        });
    }

    let features = read_be_u32(data, DEVICE_DESC_EXT_FEATURES_OFFSET)?;
    let hpb_supported = features & EXT_FEATURE_HPB != 0;
    // Devices without the feature may truncate the descriptor before the
    // version field, so it is only read when the capability bit is set.
    let hpb_version = if hpb_supported {
        read_be_u16(data, DEVICE_DESC_HPB_VERSION_OFFSET)?
    } else {
        0
    };

    Ok(DeviceDescriptor {
        hpb_supported,
        hpb_version,
    })
}

// ── Geometry descriptor ────────────────────────────────────────────────────

const GEOMETRY_DESC_IDN_OFFSET: usize = 0x01;
/// bHPBRegionSize — log2 of the region size in 512-byte units.
const GEOMETRY_DESC_REGION_SIZE_OFFSET: usize = 0x48;
const GEOMETRY_DESC_NUMBER_LU_OFFSET: usize = 0x49;
/// bHPBSubRegionSize — log2 of the subregion size in 512-byte units.
const GEOMETRY_DESC_SUBREGION_SIZE_OFFSET: usize = 0x4A;
/// wDeviceMaxActiveHPBRegions (u16).
const GEOMETRY_DESC_MAX_ACTIVE_OFFSET: usize = 0x4B;

/// HPB-relevant fields of the geometry descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryDescriptor {
    pub region_size_exp: u8,
    pub subregion_size_exp: u8,
    pub hpb_number_lu: u8,
    pub device_max_active_regions: u16,
}

pub fn parse_geometry_descriptor(data: &[u8]) -> Result<GeometryDescriptor, ParseError> {
    let idn = read_u8(data, GEOMETRY_DESC_IDN_OFFSET)?;
    if idn != DescriptorId::Geometry.idn() {
        return Err(ParseError::InvalidField {
            field: "bDescriptorIDN",
            reason: "not a geometry descriptor",
        });
    }

    let descriptor = GeometryDescriptor {
        region_size_exp: read_u8(data, GEOMETRY_DESC_REGION_SIZE_OFFSET)?,
        subregion_size_exp: read_u8(data, GEOMETRY_DESC_SUBREGION_SIZE_OFFSET)?,
        hpb_number_lu: read_u8(data, GEOMETRY_DESC_NUMBER_LU_OFFSET)?,
        device_max_active_regions: read_be_u16(data, GEOMETRY_DESC_MAX_ACTIVE_OFFSET)?,
    };

    if descriptor.hpb_number_lu == 0 {
        return Err(ParseError::InvalidField {
            field: "bHPBNumberLU",
            reason: "device reports HPB support but zero HPB LUs",
        });
    }
    if descriptor.device_max_active_regions == 0 {
        return Err(ParseError::InvalidField {
            field: "wDeviceMaxActiveHPBRegions",
            reason: "must be at least 1",
        });
    }

    Ok(descriptor)
}

// ── Unit descriptor ────────────────────────────────────────────────────────

const UNIT_DESC_IDN_OFFSET: usize = 0x01;
const UNIT_DESC_LU_ENABLE_OFFSET: usize = 0x03;
const UNIT_DESC_QUEUE_DEPTH_OFFSET: usize = 0x06;
/// bLogicalBlockSize — log2 of the block size in bytes.
const UNIT_DESC_BLOCK_SIZE_OFFSET: usize = 0x0A;
/// qLogicalBlockCount (u64).
const UNIT_DESC_BLOCK_COUNT_OFFSET: usize = 0x0B;
/// wLUMaxActiveHPBRegions (u16).
const UNIT_DESC_MAX_ACTIVE_OFFSET: usize = 0x23;
/// wHPBPinnedRegionStartIdx (u16).
const UNIT_DESC_PINNED_START_OFFSET: usize = 0x25;
/// wNumHPBPinnedRegions (u16).
const UNIT_DESC_PINNED_COUNT_OFFSET: usize = 0x27;

/// bLUEnable value marking an HPB-enabled logical unit.
const LU_ENABLE_HPB: u8 = 0x02;

/// HPB-relevant fields of one unit descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub lu_enable: u8,
    pub queue_depth: u8,
    pub block_shift: u8,
    pub block_count: u64,
    pub max_active_regions: u16,
    pub pinned_start: u16,
    pub pinned_count: u16,
}

impl UnitDescriptor {
    /// Whether this LU participates in HPB at all.
    #[must_use]
    pub fn is_hpb_enabled(&self) -> bool {
        self.lu_enable == LU_ENABLE_HPB && self.max_active_regions > 0
    }
}

pub fn parse_unit_descriptor(data: &[u8]) -> Result<UnitDescriptor, ParseError> {
    let idn = read_u8(data, UNIT_DESC_IDN_OFFSET)?;
    if idn != DescriptorId::Unit.idn() {
        return Err(ParseError::InvalidField {
            field: "bDescriptorIDN",
            reason: "not a unit descriptor",
        });
    }

    let lu_enable = read_u8(data, UNIT_DESC_LU_ENABLE_OFFSET)?;
    let queue_depth = read_u8(data, UNIT_DESC_QUEUE_DEPTH_OFFSET)?;
    let block_shift = read_u8(data, UNIT_DESC_BLOCK_SIZE_OFFSET)?;
    let block_count = read_be_u64(data, UNIT_DESC_BLOCK_COUNT_OFFSET)?;

    // Non-HPB LUs end before the HPB fields.
    if lu_enable != LU_ENABLE_HPB {
        return Ok(UnitDescriptor {
            lu_enable,
            queue_depth,
            block_shift,
            block_count,
            max_active_regions: 0,
            pinned_start: 0,
            pinned_count: 0,
        });
    }

    Ok(UnitDescriptor {
        lu_enable,
        queue_depth,
        block_shift,
        block_count,
        max_active_regions: read_be_u16(data, UNIT_DESC_MAX_ACTIVE_OFFSET)?,
        pinned_start: read_be_u16(data, UNIT_DESC_PINNED_START_OFFSET)?,
        pinned_count: read_be_u16(data, UNIT_DESC_PINNED_COUNT_OFFSET)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_desc(hpb: bool, version: u16) -> Vec<u8> {
        let mut data = vec![0_u8; 0x59];
        data[0] = 0x59;
        data[DEVICE_DESC_IDN_OFFSET] = DescriptorId::Device.idn();
        if hpb {
            data[DEVICE_DESC_EXT_FEATURES_OFFSET + 3] = 0x80;
            data[DEVICE_DESC_HPB_VERSION_OFFSET..DEVICE_DESC_HPB_VERSION_OFFSET + 2]
                .copy_from_slice(&version.to_be_bytes());
        }
        data
    }

    fn unit_desc(lu_enable: u8) -> Vec<u8> {
        let mut data = vec![0_u8; 0x2D];
        data[0] = 0x2D;
        data[UNIT_DESC_IDN_OFFSET] = DescriptorId::Unit.idn();
        data[UNIT_DESC_LU_ENABLE_OFFSET] = lu_enable;
        data[UNIT_DESC_QUEUE_DEPTH_OFFSET] = 32;
        data[UNIT_DESC_BLOCK_SIZE_OFFSET] = 12;
        data[UNIT_DESC_BLOCK_COUNT_OFFSET..UNIT_DESC_BLOCK_COUNT_OFFSET + 8]
            .copy_from_slice(&4096_u64.to_be_bytes());
        data[UNIT_DESC_MAX_ACTIVE_OFFSET..UNIT_DESC_MAX_ACTIVE_OFFSET + 2]
            .copy_from_slice(&8_u16.to_be_bytes());
        data[UNIT_DESC_PINNED_START_OFFSET..UNIT_DESC_PINNED_START_OFFSET + 2]
            .copy_from_slice(&0_u16.to_be_bytes());
        data[UNIT_DESC_PINNED_COUNT_OFFSET..UNIT_DESC_PINNED_COUNT_OFFSET + 2]
            .copy_from_slice(&2_u16.to_be_bytes());
        data
    }

    #[test]
    fn device_descriptor_hpb_bit_and_version() {
        let desc = parse_device_descriptor(&device_desc(true, 0x0100)).expect("parse");
        assert!(desc.hpb_supported);
        assert_eq!(desc.hpb_version, 0x0100);

        let desc = parse_device_descriptor(&device_desc(false, 0)).expect("parse");
        assert!(!desc.hpb_supported);
    }

    #[test]
    fn device_descriptor_wrong_idn_rejected() {
        let mut data = device_desc(true, 0x0100);
        data[DEVICE_DESC_IDN_OFFSET] = DescriptorId::Geometry.idn();
        assert!(matches!(
            parse_device_descriptor(&data),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn geometry_descriptor_round_trip() {
        let mut data = vec![0_u8; 0x57];
        data[0] = 0x57;
        data[GEOMETRY_DESC_IDN_OFFSET] = DescriptorId::Geometry.idn();
        data[GEOMETRY_DESC_REGION_SIZE_OFFSET] = 15; // 16 MiB regions
        data[GEOMETRY_DESC_NUMBER_LU_OFFSET] = 1;
        data[GEOMETRY_DESC_SUBREGION_SIZE_OFFSET] = 13; // 4 MiB subregions
        data[GEOMETRY_DESC_MAX_ACTIVE_OFFSET..GEOMETRY_DESC_MAX_ACTIVE_OFFSET + 2]
            .copy_from_slice(&1024_u16.to_be_bytes());

        let desc = parse_geometry_descriptor(&data).expect("parse");
        assert_eq!(desc.region_size_exp, 15);
        assert_eq!(desc.subregion_size_exp, 13);
        assert_eq!(desc.hpb_number_lu, 1);
        assert_eq!(desc.device_max_active_regions, 1024);
    }

    #[test]
    fn unit_descriptor_hpb_fields() {
        let desc = parse_unit_descriptor(&unit_desc(LU_ENABLE_HPB)).expect("parse");
        assert!(desc.is_hpb_enabled());
        assert_eq!(desc.queue_depth, 32);
        assert_eq!(desc.block_shift, 12);
        assert_eq!(desc.block_count, 4096);
        assert_eq!(desc.max_active_regions, 8);
        assert_eq!(desc.pinned_count, 2);
    }

    #[test]
    fn non_hpb_unit_parses_without_hpb_fields() {
        // A plain LU's descriptor is shorter; the HPB tail must not be read.
        let mut data = unit_desc(0x01);
        data.truncate(0x13);
        let desc = parse_unit_descriptor(&data).expect("parse");
        assert!(!desc.is_hpb_enabled());
        assert_eq!(desc.max_active_regions, 0);
    }

    #[test]
    fn truncated_unit_descriptor_rejected() {
        let mut data = unit_desc(LU_ENABLE_HPB);
        data.truncate(UNIT_DESC_PINNED_COUNT_OFFSET);
        assert!(matches!(
            parse_unit_descriptor(&data),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
