#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one cached physical-page-number entry on the wire, in bytes.
pub const PPN_ENTRY_SIZE: u32 = 8;

/// Protocol maximum of active (region, subregion) pairs per notification.
pub const MAX_ACTIVE_PER_NOTICE: usize = 2;

/// Protocol maximum of inactive regions per notification.
pub const MAX_INACTIVE_PER_NOTICE: usize = 2;

/// Region index within one logical unit (u16 on the wire, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u16);

/// Subregion index within its parent region (u16 on the wire, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubregionId(pub u16);

/// Logical block address within one logical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

/// Device-internal physical page number for one logical block.
///
/// Opaque to the host: it is copied out of a downloaded map table into a
/// direct-physical read command and never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ppn(pub u64);

/// Logical unit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LunId(pub u8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── LU geometry ─────────────────────────────────────────────────────────────

/// Derived per-LU sizing constants for the region cache.
///
/// Built once at attach time from the geometry and unit descriptors; every
/// per-I/O address split is a shift/mask against these fields, never a
/// re-parse of descriptor bytes. Region and subregion sizes are device
/// guaranteed powers of two, so the constructor stores shift amounts.
///
/// The last region of an LU may be partial: fewer subregions than
/// [`subregions_per_region`](Self::subregions_per_region) and a short tail
/// subregion. All `*_in_*` accessors account for this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LuGeometry {
    /// log2 of bytes per logical block.
    block_shift: u32,
    /// log2 of logical blocks (= map entries) per region.
    region_shift: u32,
    /// log2 of logical blocks (= map entries) per subregion.
    subregion_shift: u32,
    block_count: u64,
    region_count: u16,
    max_active_regions: u16,
    pinned_start: u16,
    pinned_count: u16,
    queue_depth: u8,
}

impl LuGeometry {
    /// Build geometry from descriptor-reported exponents.
    ///
    /// `region_size_exp` and `subregion_size_exp` are log2 of the region /
    /// subregion size in 512-byte units, exactly as the geometry descriptor
    /// reports them. `block_shift` is log2 of the logical block size in
    /// bytes from the unit descriptor.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        region_size_exp: u8,
        subregion_size_exp: u8,
        block_shift: u8,
        block_count: u64,
        max_active_regions: u16,
        pinned_start: u16,
        pinned_count: u16,
        queue_depth: u8,
    ) -> Result<Self, ParseError> {
        let block_shift = u32::from(block_shift);
        if !(9..=16).contains(&block_shift) {
            return Err(ParseError::InvalidField {
                field: "bLogicalBlockSize",
                reason: "must be in 9..=16 (512B..64KiB blocks)",
            });
        }

        // Descriptor exponents are in 512-byte units; convert to blocks.
        let region_shift = (u32::from(region_size_exp) + 9)
            .checked_sub(block_shift)
            .ok_or(ParseError::InvalidField {
                field: "bHPBRegionSize",
                reason: "region smaller than one logical block",
            })?;
        let subregion_shift = (u32::from(subregion_size_exp) + 9)
            .checked_sub(block_shift)
            .ok_or(ParseError::InvalidField {
                field: "bHPBSubRegionSize",
                reason: "subregion smaller than one logical block",
            })?;
        if subregion_shift > region_shift {
            return Err(ParseError::InvalidField {
                field: "bHPBSubRegionSize",
                reason: "subregion larger than region",
            });
        }
        if region_shift >= 32 {
            return Err(ParseError::InvalidField {
                field: "bHPBRegionSize",
                reason: "region entry count exceeds u32",
            });
        }
        if region_shift - subregion_shift >= 16 {
            return Err(ParseError::InvalidField {
                field: "bHPBSubRegionSize",
                reason: "subregions per region exceed u16",
            });
        }
        if block_count == 0 {
            return Err(ParseError::InvalidField {
                field: "qLogicalBlockCount",
                reason: "zero-length logical unit",
            });
        }

        let entries_per_region = 1_u64 << region_shift;
        let regions = block_count.div_ceil(entries_per_region);
        let region_count =
            u16::try_from(regions).map_err(|_| ParseError::IntegerConversion {
                field: "region_count",
            })?;

        if max_active_regions == 0 {
            return Err(ParseError::InvalidField {
                field: "wMaxActiveHPBRegions",
                reason: "must be at least 1",
            });
        }
        if pinned_count > max_active_regions {
            return Err(ParseError::InvalidField {
                field: "wNumHPBPinnedRegions",
                reason: "pinned regions exceed the active-region budget",
            });
        }
        if pinned_count > 0 {
            let pinned_end =
                pinned_start
                    .checked_add(pinned_count)
                    .ok_or(ParseError::InvalidField {
                        field: "wHPBPinnedRegionStartIdx",
                        reason: "pinned range overflows u16",
                    })?;
            if pinned_end > region_count {
                return Err(ParseError::InvalidField {
                    field: "wHPBPinnedRegionStartIdx",
                    reason: "pinned range exceeds region count",
                });
            }
        }
        if queue_depth == 0 {
            return Err(ParseError::InvalidField {
                field: "bLUQueueDepth",
                reason: "must be at least 1",
            });
        }

        Ok(Self {
            block_shift,
            region_shift,
            subregion_shift,
            block_count,
            region_count,
            max_active_regions,
            pinned_start,
            pinned_count,
            queue_depth,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    #[must_use]
    pub fn region_count(&self) -> u16 {
        self.region_count
    }

    #[must_use]
    pub fn max_active_regions(&self) -> u16 {
        self.max_active_regions
    }

    #[must_use]
    pub fn pinned_count(&self) -> u16 {
        self.pinned_count
    }

    #[must_use]
    pub fn queue_depth(&self) -> u8 {
        self.queue_depth
    }

    /// Map entries (logical blocks) in a full region.
    #[must_use]
    pub fn entries_per_region(&self) -> u32 {
        1 << self.region_shift
    }

    /// Map entries (logical blocks) in a full subregion.
    #[must_use]
    pub fn entries_per_subregion(&self) -> u32 {
        1 << self.subregion_shift
    }

    /// Subregions in a full region.
    #[must_use]
    pub fn subregions_per_region(&self) -> u16 {
        1 << (self.region_shift - self.subregion_shift)
    }

    /// Whether `region` falls in the device-designated pinned range.
    #[must_use]
    pub fn is_pinned(&self, region: RegionId) -> bool {
        self.pinned_count > 0
            && region.0 >= self.pinned_start
            && region.0 < self.pinned_start + self.pinned_count
    }

    /// Pinned region indices, in ascending order.
    pub fn pinned_regions(&self) -> impl Iterator<Item = RegionId> + '_ {
        (self.pinned_start..self.pinned_start.saturating_add(self.pinned_count)).map(RegionId)
    }

    /// Split an LBA into its (region, subregion, entry) coordinates.
    ///
    /// Returns `None` for an LBA beyond the end of the LU.
    #[must_use]
    pub fn locate(&self, lba: Lba) -> Option<(RegionId, SubregionId, u32)> {
        if lba.0 >= self.block_count {
            return None;
        }
        // region_count fits u16 by construction, so both casts are exact.
        #[expect(clippy::cast_possible_truncation)]
        let region = (lba.0 >> self.region_shift) as u16;
        let within_region = lba.0 & ((1 << self.region_shift) - 1);
        #[expect(clippy::cast_possible_truncation)]
        let subregion = (within_region >> self.subregion_shift) as u16;
        #[expect(clippy::cast_possible_truncation)]
        let entry = (within_region & ((1 << self.subregion_shift) - 1)) as u32;
        Some((RegionId(region), SubregionId(subregion), entry))
    }

    /// Map entries in `region`, short for a partial last region.
    #[must_use]
    pub fn entries_in_region(&self, region: RegionId) -> u32 {
        let start = u64::from(region.0) << self.region_shift;
        let remaining = self.block_count.saturating_sub(start);
        let full = u64::from(self.entries_per_region());
        #[expect(clippy::cast_possible_truncation)]
        let entries = remaining.min(full) as u32;
        entries
    }

    /// Subregions in `region`, short for a partial last region.
    #[must_use]
    pub fn subregions_in_region(&self, region: RegionId) -> u16 {
        let entries = self.entries_in_region(region);
        let per = self.entries_per_subregion();
        #[expect(clippy::cast_possible_truncation)]
        let count = entries.div_ceil(per) as u16;
        count
    }

    /// Map entries in `(region, subregion)`, short for a partial tail.
    #[must_use]
    pub fn entries_in_subregion(&self, region: RegionId, subregion: SubregionId) -> u32 {
        let region_entries = self.entries_in_region(region);
        let start = u32::from(subregion.0) << self.subregion_shift;
        let remaining = region_entries.saturating_sub(start);
        remaining.min(self.entries_per_subregion())
    }

    /// Wire length in bytes of one subregion's map download.
    #[must_use]
    pub fn map_read_len(&self, region: RegionId, subregion: SubregionId) -> u32 {
        self.entries_in_subregion(region, subregion) * PPN_ENTRY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4 KiB blocks, 64 KiB subregions (16 entries), 256 KiB regions
    // (64 entries, 4 subregions per region).
    fn small_geometry(block_count: u64) -> LuGeometry {
        LuGeometry::new(9, 7, 12, block_count, 4, 0, 0, 8).expect("geometry")
    }

    #[test]
    fn shift_math_splits_lba() {
        let geo = small_geometry(1024);
        assert_eq!(geo.entries_per_region(), 64);
        assert_eq!(geo.entries_per_subregion(), 16);
        assert_eq!(geo.subregions_per_region(), 4);

        assert_eq!(
            geo.locate(Lba(0)),
            Some((RegionId(0), SubregionId(0), 0))
        );
        assert_eq!(
            geo.locate(Lba(17)),
            Some((RegionId(0), SubregionId(1), 1))
        );
        assert_eq!(
            geo.locate(Lba(64)),
            Some((RegionId(1), SubregionId(0), 0))
        );
        assert_eq!(
            geo.locate(Lba(1023)),
            Some((RegionId(15), SubregionId(3), 15))
        );
        assert_eq!(geo.locate(Lba(1024)), None);
    }

    #[test]
    fn partial_last_region_is_short() {
        // 100 blocks: one full region of 64 plus a partial of 36 entries
        // (2 full subregions of 16 + one 4-entry tail).
        let geo = small_geometry(100);
        assert_eq!(geo.region_count(), 2);
        assert_eq!(geo.entries_in_region(RegionId(0)), 64);
        assert_eq!(geo.entries_in_region(RegionId(1)), 36);
        assert_eq!(geo.subregions_in_region(RegionId(1)), 3);
        assert_eq!(geo.entries_in_subregion(RegionId(1), SubregionId(0)), 16);
        assert_eq!(geo.entries_in_subregion(RegionId(1), SubregionId(2)), 4);
        assert_eq!(geo.map_read_len(RegionId(1), SubregionId(2)), 32);
    }

    #[test]
    fn pinned_range_is_validated() {
        assert!(LuGeometry::new(9, 7, 12, 1024, 4, 0, 2, 8).is_ok());
        // Pinned range past the end of the table.
        assert!(matches!(
            LuGeometry::new(9, 7, 12, 1024, 4, 15, 2, 8),
            Err(ParseError::InvalidField { .. })
        ));
        // More pinned regions than the activation budget.
        assert!(matches!(
            LuGeometry::new(9, 7, 12, 1024, 4, 0, 5, 8),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn pinned_membership() {
        let geo = LuGeometry::new(9, 7, 12, 1024, 4, 2, 2, 8).expect("geometry");
        assert!(!geo.is_pinned(RegionId(1)));
        assert!(geo.is_pinned(RegionId(2)));
        assert!(geo.is_pinned(RegionId(3)));
        assert!(!geo.is_pinned(RegionId(4)));
        let pinned: Vec<_> = geo.pinned_regions().collect();
        assert_eq!(pinned, vec![RegionId(2), RegionId(3)]);
    }

    #[test]
    fn subregion_larger_than_region_rejected() {
        assert!(matches!(
            LuGeometry::new(7, 9, 12, 1024, 4, 0, 0, 8),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn region_smaller_than_block_rejected() {
        assert!(matches!(
            LuGeometry::new(1, 1, 12, 1024, 4, 0, 0, 8),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn be_readers_round_trip() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(read_be_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_be_u32(&data, 2).unwrap(), 0x5678_9ABC);
        assert_eq!(read_be_u64(&data, 0).unwrap(), 0x1234_5678_9ABC_DEF0);
        assert!(matches!(
            read_be_u16(&data, 7),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
