#![forbid(unsafe_code)]
//! Whole-device probe tests: descriptor bytes in, per-LU engines out.

use hpb_core::{
    DescriptorSource, FeatureSupport, HpbConfig, HpbDevice, IoCommand, LuState, MapCompletion,
    MapDownloader, MapRequest,
};
use hpb_desc::DescriptorId;
use hpb_error::{HpbError, Result};
use hpb_types::{Lba, LunId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct ScriptedSource {
    descriptors: HashMap<(DescriptorId, u8), Vec<u8>>,
}

impl ScriptedSource {
    fn insert(&mut self, id: DescriptorId, index: u8, bytes: Vec<u8>) {
        self.descriptors.insert((id, index), bytes);
    }
}

impl DescriptorSource for ScriptedSource {
    fn read_descriptor(&self, id: DescriptorId, index: u8) -> Result<Vec<u8>> {
        self.descriptors
            .get(&(id, index))
            .cloned()
            .ok_or_else(|| HpbError::Descriptor(format!("no {id:?} descriptor at {index}")))
    }
}

#[derive(Default)]
struct NullDownloader {
    submitted: Mutex<Vec<MapRequest>>,
}

impl MapDownloader for NullDownloader {
    fn submit_map_read(&self, request: MapRequest, _complete: MapCompletion) {
        self.submitted.lock().push(request);
    }
}

fn device_descriptor(hpb: bool) -> Vec<u8> {
    let mut data = vec![0_u8; 0x59];
    data[0] = 0x59;
    data[1] = DescriptorId::Device.idn();
    if hpb {
        data[0x4F + 3] = 0x80; // HPB bit of dExtendedUFSFeaturesSupport
        data[0x53..0x55].copy_from_slice(&0x0200_u16.to_be_bytes());
    }
    data
}

fn geometry_descriptor(device_max_active: u16) -> Vec<u8> {
    let mut data = vec![0_u8; 0x57];
    data[0] = 0x57;
    data[1] = DescriptorId::Geometry.idn();
    data[0x48] = 7; // 64 KiB regions
    data[0x49] = 1; // bHPBNumberLU
    data[0x4A] = 6; // 32 KiB subregions
    data[0x4B..0x4D].copy_from_slice(&device_max_active.to_be_bytes());
    data
}

fn unit_descriptor(lu_enable: u8, max_active: u16, block_count: u64) -> Vec<u8> {
    let mut data = vec![0_u8; 0x2D];
    data[0] = 0x2D;
    data[1] = DescriptorId::Unit.idn();
    data[0x03] = lu_enable;
    data[0x06] = 16; // queue depth
    data[0x0A] = 12; // 4 KiB blocks
    data[0x0B..0x13].copy_from_slice(&block_count.to_be_bytes());
    data[0x23..0x25].copy_from_slice(&max_active.to_be_bytes());
    data
}

#[test]
fn probe_attaches_engines_for_hpb_lus_only() {
    let mut source = ScriptedSource::default();
    source.insert(DescriptorId::Device, 0, device_descriptor(true));
    source.insert(DescriptorId::Geometry, 0, geometry_descriptor(8));
    source.insert(DescriptorId::Unit, 0, unit_descriptor(0x02, 4, 64));
    source.insert(DescriptorId::Unit, 1, unit_descriptor(0x01, 0, 64));

    let downloader: Arc<NullDownloader> = Arc::new(NullDownloader::default());
    let downloader_dyn: Arc<dyn MapDownloader> = downloader;
    let mut device = HpbDevice::probe(&source, &downloader_dyn, &HpbConfig::default());

    assert_eq!(
        device.support(),
        FeatureSupport::Supported { version: 0x0200 }
    );
    assert_eq!(device.lus().count(), 1);

    let lu = device.lu(LunId(0)).expect("LU 0 engine");
    assert_eq!(lu.state(), LuState::Present);
    assert_eq!(lu.geometry().region_count(), 4);
    assert_eq!(lu.geometry().max_active_regions(), 4);
    assert!(device.lu(LunId(1)).is_none());

    // Routing to an absent LU is a harmless no-op.
    let mut cmd = IoCommand::read(Lba(0), 1);
    device.prep(LunId(5), &mut cmd);
    assert!(!cmd.is_direct());
    device.on_response(LunId(5), &[0_u8; 32]);

    device.teardown();
    device.teardown();
    assert_eq!(
        device.lu(LunId(0)).map(|lu| lu.state()),
        Some(LuState::TornDown)
    );
}

#[test]
fn probe_without_hpb_support_is_not_supported() {
    let mut source = ScriptedSource::default();
    source.insert(DescriptorId::Device, 0, device_descriptor(false));

    let downloader: Arc<dyn MapDownloader> = Arc::new(NullDownloader::default());
    let device = HpbDevice::probe(&source, &downloader, &HpbConfig::default());
    assert_eq!(device.support(), FeatureSupport::NotSupported);
    assert_eq!(device.lus().count(), 0);
}

#[test]
fn probe_with_missing_geometry_descriptor_disables_feature() {
    let mut source = ScriptedSource::default();
    source.insert(DescriptorId::Device, 0, device_descriptor(true));

    let downloader: Arc<dyn MapDownloader> = Arc::new(NullDownloader::default());
    let device = HpbDevice::probe(&source, &downloader, &HpbConfig::default());
    assert_eq!(device.support(), FeatureSupport::NotSupported);
}

#[test]
fn lu_budget_is_clamped_to_device_maximum() {
    let mut source = ScriptedSource::default();
    source.insert(DescriptorId::Device, 0, device_descriptor(true));
    source.insert(DescriptorId::Geometry, 0, geometry_descriptor(2));
    source.insert(DescriptorId::Unit, 0, unit_descriptor(0x02, 1000, 64));

    let downloader: Arc<dyn MapDownloader> = Arc::new(NullDownloader::default());
    let device = HpbDevice::probe(&source, &downloader, &HpbConfig::default());
    let lu = device.lu(LunId(0)).expect("LU 0 engine");
    assert_eq!(lu.geometry().max_active_regions(), 2);
}
