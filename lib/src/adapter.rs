//! Lifecycle of a single camera.
//!
//! A `CameraAdapter` owns the driver of one camera and the `CaptureEngine`
//! buffers go through. It takes care of opening the driver, translating the
//! client's stream configuration into the driver's, and of keeping the
//! request settings in sync with the capture parameters.
use crate::driver::{BufferUsage, CaptureDriver, DriverError, HalPixelFormat, StreamConfiguration};
use crate::engine::{CanceledBuffer, CaptureEngine, DrainError, QueueError, StartError, StopError};
use crate::memory::{BufferGeometry, BufferMapper, CameraBuffer, MapError, MemoryType};
use crate::settings::{OperationMode, Parameters, RequestTemplate};
use crate::{PixelFormat, StreamId};

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long `dqbuf` waits for a buffer by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of buffers the driver is told to expect when none has been
/// allocated through the adapter.
const DEFAULT_MAX_BUFFERS: u32 = 2;

/// DMA-buf buffers need their height to be a multiple of this.
const DMABUF_HEIGHT_ALIGNMENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    drain_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        AdapterConfig {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Time `dqbuf` waits for a buffer before giving up.
    pub fn drain_timeout(self, drain_timeout: Duration) -> Self {
        AdapterConfig { drain_timeout }
    }
}

/// A stream as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Kind of buffers that will be queued to the stream.
    pub memory: MemoryType,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("camera is not open")]
    NotOpen,
    #[error("exactly one stream must be configured, got {0}")]
    BadStreamConfig(usize),
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("stream geometry {0}x{1} is too large")]
    StreamTooLarge(u32, u32),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("buffer error: {0}")]
    Map(#[from] MapError),
    #[error("error while stopping capture: {0}")]
    Stop(#[from] StopError),
}

/// Translate a client stream into the stream to configure on the driver.
fn driver_stream(
    stream: &StreamConfig,
    max_buffers: u32,
    operation_mode: OperationMode,
) -> Result<StreamConfiguration, AdapterError> {
    let (height, usage) = match stream.memory {
        MemoryType::DmaBuf => (
            stream
                .height
                .checked_next_multiple_of(DMABUF_HEIGHT_ALIGNMENT)
                .ok_or(AdapterError::StreamTooLarge(stream.width, stream.height))?,
            BufferUsage::HW_VIDEO_ENCODER,
        ),
        MemoryType::Mmap | MemoryType::UserPtr => (stream.height, BufferUsage::HW_COMPOSER),
    };

    Ok(StreamConfiguration {
        stream_id: stream.stream_id,
        width: stream.width,
        height,
        format: HalPixelFormat::ImplementationDefined,
        usage,
        max_buffers,
        operation_mode,
    })
}

pub struct CameraAdapter {
    config: AdapterConfig,
    driver: Arc<dyn CaptureDriver>,
    engine: CaptureEngine,
    opened: bool,
    parameters: Parameters,
    stream: Option<StreamConfiguration>,
    num_allocated: u32,
}

impl CameraAdapter {
    pub fn new(
        driver: Arc<dyn CaptureDriver>,
        mapper: Arc<dyn BufferMapper>,
        config: AdapterConfig,
    ) -> Self {
        let engine = CaptureEngine::new(Arc::clone(&driver), mapper);

        CameraAdapter {
            config,
            driver,
            engine,
            opened: false,
            parameters: Default::default(),
            stream: None,
            num_allocated: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// The stream currently configured on the driver.
    pub fn stream(&self) -> Option<&StreamConfiguration> {
        self.stream.as_ref()
    }

    pub fn engine(&self) -> &CaptureEngine {
        &self.engine
    }

    /// Initialize the driver and build the default request settings.
    pub fn open(&mut self) -> Result<(), AdapterError> {
        if self.opened {
            return Ok(());
        }

        self.driver.initialize(self.engine.result_sink())?;
        let mut settings = self.driver.default_settings(RequestTemplate::Preview)?;
        settings.request_id = RequestTemplate::Preview as u32;

        self.parameters = settings.parameters.clone();
        self.engine.set_settings(settings);
        self.opened = true;
        debug!("Camera opened");

        Ok(())
    }

    /// Configure the stream buffers will be captured into. Exactly one
    /// stream is supported.
    pub fn configure_streams(&mut self, streams: &[StreamConfig]) -> Result<(), AdapterError> {
        if !self.opened {
            return Err(AdapterError::NotOpen);
        }
        let stream = match streams {
            [stream] => stream,
            _ => {
                error!("Bad stream configuration: {} streams", streams.len());
                return Err(AdapterError::BadStreamConfig(streams.len()));
            }
        };

        let max_buffers = if self.num_allocated > 0 {
            self.num_allocated
        } else {
            DEFAULT_MAX_BUFFERS
        };
        let config = driver_stream(
            stream,
            max_buffers,
            OperationMode::from_parameters(&self.parameters),
        )?;
        self.driver.configure_streams(&config)?;

        info!(
            "Configured {}: {}x{} {} ({:?})",
            stream.stream_id, config.width, config.height, stream.format, stream.memory
        );
        self.engine.configure_stream(Some(stream.stream_id));
        self.stream = Some(config);

        Ok(())
    }

    /// Set the capture parameters. They apply to the requests dispatched
    /// from now on, and their operation mode to the next stream
    /// configuration.
    pub fn set_parameters(&mut self, parameters: Parameters) -> Result<(), AdapterError> {
        if !self.opened {
            return Err(AdapterError::NotOpen);
        }

        debug!(
            "New parameters {:?}, operation mode {:?}",
            parameters,
            OperationMode::from_parameters(&parameters)
        );
        let settings = self.engine.settings().with_parameters(parameters.clone());
        self.engine.set_settings(settings);
        self.parameters = parameters;

        Ok(())
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Allocate a buffer of `geometry` that can be queued to the stream.
    /// Only NV12 buffers are supported.
    pub fn allocate_memory(
        &mut self,
        geometry: &BufferGeometry,
    ) -> Result<CameraBuffer, AdapterError> {
        if geometry.format != PixelFormat::NV12 {
            error!("Only NV12 is supported, cannot allocate {}", geometry.format);
            return Err(AdapterError::UnsupportedFormat(geometry.format));
        }

        let buffer = self.engine.allocate(geometry)?;
        self.num_allocated += 1;

        Ok(buffer)
    }

    /// Queue `buffer` for capture into `stream_id`.
    pub fn qbuf(&self, stream_id: StreamId, buffer: CameraBuffer) -> Result<(), QueueError> {
        self.engine.submit(stream_id, buffer)
    }

    /// Wait for the next captured buffer.
    pub fn dqbuf(&self) -> Result<CameraBuffer, DrainError> {
        self.engine.drain(self.config.drain_timeout)
    }

    pub fn start(&self) -> Result<(), StartError> {
        self.engine.start()
    }

    pub fn stop(&self) -> Result<Vec<CanceledBuffer>, StopError> {
        self.engine.stop()
    }

    /// Stop capturing, release every buffer and close the driver. The buffers
    /// still owned by the adapter are returned.
    pub fn close(&mut self) -> Result<Vec<CanceledBuffer>, AdapterError> {
        if !self.opened {
            return Ok(Vec::new());
        }

        let canceled = self.engine.shutdown()?;
        self.driver.close();

        self.opened = false;
        self.stream = None;
        self.num_allocated = 0;
        debug!("Camera closed, {} buffers returned", canceled.len());

        Ok(canceled)
    }
}

impl Drop for CameraAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error while closing camera: {}", e);
        }
    }
}
