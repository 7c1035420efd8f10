//! On-disk pipeline cache.
//!
//! The blob written by the driver starts with a header (`u32` header size,
//! `u32` version, `u32` vendor ID, `u32` device ID, 16-byte cache UUID). A blob
//! is only handed back to the driver when the header matches the live device;
//! anything else is a cold start, never an error.

use crate::device::LogicalDevice;
use crate::error::Result;
use crate::physical_device::DeviceIdentity;
use ash::vk;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of the version-one header in bytes.
pub const HEADER_SIZE: usize = 16 + vk::UUID_SIZE;
const HEADER_VERSION_ONE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub header_size: u32,
    pub version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub uuid: [u8; vk::UUID_SIZE],
}

/// Why a stored blob was not reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRejection {
    TooSmall,
    HeaderSize,
    Version,
    Vendor,
    Device,
    Uuid,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

pub fn parse_header(blob: &[u8]) -> Option<CacheHeader> {
    if blob.len() < HEADER_SIZE {
        return None;
    }
    let mut uuid = [0u8; vk::UUID_SIZE];
    uuid.copy_from_slice(&blob[16..HEADER_SIZE]);
    Some(CacheHeader {
        header_size: read_u32(blob, 0),
        version: read_u32(blob, 4),
        vendor_id: read_u32(blob, 8),
        device_id: read_u32(blob, 12),
        uuid,
    })
}

/// Checks a stored blob against the live device.
pub fn validate_blob(blob: &[u8], identity: &DeviceIdentity) -> std::result::Result<(), CacheRejection> {
    let header = parse_header(blob).ok_or(CacheRejection::TooSmall)?;
    if (header.header_size as usize) < HEADER_SIZE || header.header_size as usize > blob.len() {
        return Err(CacheRejection::HeaderSize);
    }
    if header.version != HEADER_VERSION_ONE {
        return Err(CacheRejection::Version);
    }
    if header.vendor_id != identity.vendor_id {
        return Err(CacheRejection::Vendor);
    }
    if header.device_id != identity.device_id {
        return Err(CacheRejection::Device);
    }
    if header.uuid != identity.pipeline_cache_uuid {
        return Err(CacheRejection::Uuid);
    }
    Ok(())
}

/// Reads and writes cache blobs at a fixed path.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored blob if it is valid for `identity`.
    pub fn load(&self, identity: &DeviceIdentity) -> Option<Vec<u8>> {
        let blob = match fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No pipeline cache at {}; starting cold.", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read pipeline cache {}: {}", self.path.display(), e);
                return None;
            }
        };
        match validate_blob(&blob, identity) {
            Ok(()) => Some(blob),
            Err(reason) => {
                info!("Discarding pipeline cache {} ({:?}).", self.path.display(), reason);
                None
            }
        }
    }

    pub fn save(&self, blob: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, blob)?;
        Ok(())
    }
}

/// Driver pipeline cache seeded from, and persisted to, a [`CacheStore`].
pub struct PipelineCache {
    raw: vk::PipelineCache,
    store: CacheStore,
    device: Arc<LogicalDevice>,
}

impl PipelineCache {
    pub fn load<P: AsRef<Path>>(device: Arc<LogicalDevice>, path: P) -> Result<Self> {
        let store = CacheStore::new(path);
        let initial = store.load(&device.physical.identity).unwrap_or_default();
        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(&initial);
        // # Safety: the initial data passed header validation for this device.
        let raw = match unsafe { device.raw.create_pipeline_cache(&create_info, None) } {
            Ok(raw) => raw,
            Err(e) if !initial.is_empty() => {
                warn!("Driver rejected stored pipeline cache ({}); starting cold.", e);
                let empty = vk::PipelineCacheCreateInfo::builder();
                // # Safety: empty create info on a live device.
                unsafe { device.raw.create_pipeline_cache(&empty, None) }?
            }
            Err(e) => return Err(e.into()),
        };
        info!("Pipeline cache ready ({} bytes reused).", initial.len());
        Ok(Self { raw, store, device })
    }

    pub fn raw(&self) -> vk::PipelineCache {
        self.raw
    }

    /// Persists the current driver data.
    pub fn save(&self) -> Result<()> {
        // # Safety: the cache belongs to this device.
        let data = unsafe { self.device.raw.get_pipeline_cache_data(self.raw) }?;
        self.store.save(&data)?;
        debug!("Pipeline cache saved to {} ({} bytes).", self.store.path().display(), data.len());
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!("Failed to persist pipeline cache: {}", e);
        }
        // # Safety: pipeline creation using the cache has finished.
        unsafe { self.device.raw.destroy_pipeline_cache(self.raw, None) };
    }
}
