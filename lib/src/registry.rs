//! Discovery and ownership of the cameras of a module.
//!
//! A `CameraModule` exposes the cameras of a system and opens their drivers.
//! The `CameraRegistry` keeps at most one open `CameraAdapter` per camera.
use crate::adapter::{AdapterConfig, AdapterError, CameraAdapter};
use crate::driver::{CaptureDriver, DriverError, HalPixelFormat};
use crate::engine::CanceledBuffer;
use crate::memory::BufferMapper;
use crate::PixelFormat;

use enumn::N;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Version reported for every camera device.
const DEVICE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Facing {
    Back = 0,
    Front = 1,
    External = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Output,
    Input,
}

/// A stream configuration a camera can produce, as reported by its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableStreamConfig {
    pub format: HalPixelFormat,
    pub width: u32,
    pub height: u32,
    pub direction: StreamDirection,
}

/// Static information about a camera, as reported by its module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCameraInfo {
    pub facing: Facing,
    /// Clockwise rotation of the sensor, in degrees.
    pub orientation: u32,
    pub stream_configs: Vec<AvailableStreamConfig>,
}

/// A stream configuration clients can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedStream {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub name: String,
    pub description: String,
    pub facing: Facing,
    pub orientation: u32,
    pub device_version: u32,
    pub streams: Vec<SupportedStream>,
}

pub trait CameraModule: Send + Sync {
    fn number_of_cameras(&self) -> u32;
    fn camera_info(&self, id: u32) -> Result<ModuleCameraInfo, DriverError>;
    fn open_device(&self, id: u32) -> Result<Arc<dyn CaptureDriver>, DriverError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid camera id {0}")]
    InvalidCameraId(u32),
    #[error("camera {0} is already open")]
    AlreadyOpen(u32),
    #[error("camera {0} is not open")]
    NotOpen(u32),
    #[error("camera {0} has no supported output stream")]
    NoStreamConfigs(u32),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("camera error: {0}")]
    Adapter(#[from] AdapterError),
}

/// Keep the output streams we can capture into. Flexible YCbCr 4:2:0 is
/// produced as NV12, the only format we support.
fn supported_streams(configs: &[AvailableStreamConfig]) -> Vec<SupportedStream> {
    configs
        .iter()
        .filter(|c| {
            c.format == HalPixelFormat::YCbCr420_888 && c.direction == StreamDirection::Output
        })
        .map(|c| SupportedStream {
            format: PixelFormat::NV12,
            width: c.width,
            height: c.height,
        })
        .collect()
}

pub struct CameraRegistry {
    module: Arc<dyn CameraModule>,
    mapper: Arc<dyn BufferMapper>,
    config: AdapterConfig,
    adapters: BTreeMap<u32, CameraAdapter>,
}

impl CameraRegistry {
    /// Create a registry for the cameras of `module`. Adapters opened through
    /// it map their buffers with `mapper` and use `config`.
    pub fn new(
        module: Arc<dyn CameraModule>,
        mapper: Arc<dyn BufferMapper>,
        config: AdapterConfig,
    ) -> Self {
        CameraRegistry {
            module,
            mapper,
            config,
            adapters: BTreeMap::new(),
        }
    }

    pub fn number_of_cameras(&self) -> u32 {
        self.module.number_of_cameras()
    }

    fn check_id(&self, id: u32) -> Result<(), RegistryError> {
        if id < self.module.number_of_cameras() {
            Ok(())
        } else {
            Err(RegistryError::InvalidCameraId(id))
        }
    }

    pub fn camera_info(&self, id: u32) -> Result<CameraInfo, RegistryError> {
        self.check_id(id)?;
        let info = self.module.camera_info(id)?;

        let streams = supported_streams(&info.stream_configs);
        if streams.is_empty() {
            warn!("Camera {} has no usable output stream", id);
            return Err(RegistryError::NoStreamConfigs(id));
        }

        let name = format!("camera{}", id);
        Ok(CameraInfo {
            description: name.clone(),
            name,
            facing: info.facing,
            orientation: info.orientation,
            device_version: DEVICE_VERSION,
            streams,
        })
    }

    /// Open camera `id` and return its adapter.
    pub fn open(&mut self, id: u32) -> Result<&mut CameraAdapter, RegistryError> {
        self.check_id(id)?;
        if self.adapters.contains_key(&id) {
            return Err(RegistryError::AlreadyOpen(id));
        }

        let driver = self.module.open_device(id)?;
        let mut adapter =
            CameraAdapter::new(driver, Arc::clone(&self.mapper), self.config.clone());
        adapter.open()?;
        debug!("Opened camera {}", id);

        Ok(self.adapters.entry(id).or_insert(adapter))
    }

    pub fn get(&self, id: u32) -> Result<&CameraAdapter, RegistryError> {
        self.check_id(id)?;
        self.adapters.get(&id).ok_or(RegistryError::NotOpen(id))
    }

    pub fn get_mut(&mut self, id: u32) -> Result<&mut CameraAdapter, RegistryError> {
        self.check_id(id)?;
        self.adapters.get_mut(&id).ok_or(RegistryError::NotOpen(id))
    }

    pub fn is_open(&self, id: u32) -> bool {
        self.adapters.contains_key(&id)
    }

    /// Close camera `id`, returning the buffers it still owned.
    pub fn close(&mut self, id: u32) -> Result<Vec<CanceledBuffer>, RegistryError> {
        self.check_id(id)?;
        let mut adapter = self
            .adapters
            .remove(&id)
            .ok_or(RegistryError::NotOpen(id))?;
        let canceled = adapter.close()?;
        debug!("Closed camera {}", id);

        Ok(canceled)
    }
}
