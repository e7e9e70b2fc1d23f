#![forbid(unsafe_code)]
//! Whole-device attach: probe descriptors, build one engine per HPB LU.
//!
//! Each LU's cache is fully independent — its own table, workers, and
//! lock — so nothing here coordinates across LUs beyond construction and
//! teardown.

use hpb_desc::{
    DescriptorId, parse_device_descriptor, parse_geometry_descriptor, parse_unit_descriptor,
};
use hpb_error::{HpbError, Result};
use hpb_types::{LuGeometry, LunId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::IoCommand;
use crate::lu::{HpbConfig, HpbLu};
use crate::traits::{DescriptorSource, MapDownloader};

/// Well-known general-purpose LU range probed for HPB units.
const MAX_GENERAL_LUNS: u8 = 8;

/// Whether the attached device advertises the feature at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSupport {
    Supported { version: u16 },
    NotSupported,
}

/// All HPB engines of one attached device, indexed by LUN.
#[derive(Debug)]
pub struct HpbDevice {
    support: FeatureSupport,
    lus: Vec<Option<HpbLu>>,
}

impl HpbDevice {
    /// Probe descriptors and attach an engine to every HPB-enabled LU.
    ///
    /// Any descriptor read or parse failure leaves the feature
    /// `NotSupported` — attach never half-activates.
    pub fn probe(
        source: &dyn DescriptorSource,
        downloader: &Arc<dyn MapDownloader>,
        config: &HpbConfig,
    ) -> Self {
        match Self::try_probe(source, downloader, config) {
            Ok(device) => device,
            Err(err) => {
                warn!(target: "hpb::lifecycle", %err, "hpb_probe_failed_feature_off");
                Self::not_supported()
            }
        }
    }

    fn not_supported() -> Self {
        Self {
            support: FeatureSupport::NotSupported,
            lus: Vec::new(),
        }
    }

    fn try_probe(
        source: &dyn DescriptorSource,
        downloader: &Arc<dyn MapDownloader>,
        config: &HpbConfig,
    ) -> Result<Self> {
        let bytes = source.read_descriptor(DescriptorId::Device, 0)?;
        let device =
            parse_device_descriptor(&bytes).map_err(|e| HpbError::Parse(e.to_string()))?;
        if !device.hpb_supported {
            info!(target: "hpb::lifecycle", "device_lacks_hpb");
            return Ok(Self::not_supported());
        }

        let bytes = source.read_descriptor(DescriptorId::Geometry, 0)?;
        let geometry =
            parse_geometry_descriptor(&bytes).map_err(|e| HpbError::Parse(e.to_string()))?;

        let mut lus: Vec<Option<HpbLu>> = (0..MAX_GENERAL_LUNS).map(|_| None).collect();
        for lun in 0..MAX_GENERAL_LUNS {
            let Ok(bytes) = source.read_descriptor(DescriptorId::Unit, lun) else {
                continue;
            };
            let unit = match parse_unit_descriptor(&bytes) {
                Ok(unit) => unit,
                Err(err) => {
                    debug!(target: "hpb::lifecycle", lun, %err, "unit_descriptor_unparseable");
                    continue;
                }
            };
            if !unit.is_hpb_enabled() {
                continue;
            }

            // The LU may not claim more residency than the device offers.
            let max_active = unit
                .max_active_regions
                .min(geometry.device_max_active_regions);
            let lu_geometry = LuGeometry::new(
                geometry.region_size_exp,
                geometry.subregion_size_exp,
                unit.block_shift,
                unit.block_count,
                max_active,
                unit.pinned_start,
                unit.pinned_count,
                unit.queue_depth,
            );
            match lu_geometry.map_err(|e| HpbError::Parse(e.to_string())).and_then(
                |lu_geometry| {
                    HpbLu::attach(LunId(lun), lu_geometry, Arc::clone(downloader), config)
                },
            ) {
                Ok(lu) => lus[usize::from(lun)] = Some(lu),
                Err(err) => {
                    warn!(target: "hpb::lifecycle", lun, %err, "lu_attach_failed_not_supported");
                }
            }
        }

        Ok(Self {
            support: FeatureSupport::Supported {
                version: device.hpb_version,
            },
            lus,
        })
    }

    #[must_use]
    pub fn support(&self) -> FeatureSupport {
        self.support
    }

    #[must_use]
    pub fn lu(&self, lun: LunId) -> Option<&HpbLu> {
        self.lus.get(usize::from(lun.0)).and_then(Option::as_ref)
    }

    /// Engines for every HPB-enabled LU.
    pub fn lus(&self) -> impl Iterator<Item = &HpbLu> {
        self.lus.iter().filter_map(Option::as_ref)
    }

    /// Route one outgoing command through its LU's prep path, if any.
    pub fn prep(&self, lun: LunId, cmd: &mut IoCommand) {
        if let Some(lu) = self.lu(lun) {
            lu.prep(cmd);
        }
    }

    /// Route one completion's response UPIU to its LU's engine, if any.
    pub fn on_response(&self, lun: LunId, upiu: &[u8]) {
        if let Some(lu) = self.lu(lun) {
            lu.on_response(upiu);
        }
    }

    /// Tear down every LU engine. Idempotent.
    pub fn teardown(&mut self) {
        for lu in self.lus.iter_mut().filter_map(Option::as_mut) {
            lu.teardown();
        }
    }
}
