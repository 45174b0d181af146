//! Contract between the adapter and the capture driver it runs on top of.
//!
//! The driver is strictly asynchronous: `CaptureDriver::submit_request` only
//! hands a request over, and the request is completed later through the
//! `ResultSink` registered with `CaptureDriver::initialize`. Each request is
//! completed by two partial results, one carrying the capture metadata and
//! one carrying the filled pixel buffer, which can be reported in any order,
//! from any thread, and possibly before `submit_request` returns.
pub mod loopback;

use crate::memory::BufferHandle;
use crate::settings::{OperationMode, RequestSettings, RequestTemplate};
use crate::StreamId;

use bitflags::bitflags;
use enumn::N;
use nix::errno::Errno;
use std::sync::Arc;
use thiserror::Error;

bitflags! {
    /// How the buffers of a stream are going to be consumed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const HW_COMPOSER = 0x0000_0800;
        const HW_VIDEO_ENCODER = 0x0001_0000;
    }
}

/// Pixel formats as understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum HalPixelFormat {
    YCrCb420Sp = 0x11,
    /// Let the driver pick the layout that suits the stream usage.
    ImplementationDefined = 0x22,
    /// Flexible YCbCr 4:2:0, which we express as NV12.
    YCbCr420_888 = 0x23,
    Blob = 0x21,
}

/// Stream to set up on the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfiguration {
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    pub format: HalPixelFormat,
    pub usage: BufferUsage,
    /// Maximum number of buffers that can be in flight at the same time.
    pub max_buffers: u32,
    pub operation_mode: OperationMode,
}

/// A request to capture one frame into `buffer`.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub sequence: u32,
    pub stream_id: StreamId,
    pub buffer: BufferHandle,
    pub settings: Arc<RequestSettings>,
}

/// Error codes the driver can attach to results and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ErrorCode {
    /// The device is in an unrecoverable state.
    Device = 1,
    /// The whole request failed.
    Request = 2,
    /// The metadata of the request could not be produced.
    Result = 3,
    /// The pixel buffer could not be filled.
    Buffer = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Capture metadata. `timestamp` is the shutter time in nanoseconds, if
    /// the driver could provide it.
    Metadata { timestamp: Option<u64> },
    /// The pixel buffer `handle` has been captured into.
    PixelBuffer { handle: BufferHandle },
}

/// Partial completion of the request with sequence number `sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureResult {
    pub sequence: u32,
    pub kind: ResultKind,
    pub error: Option<ErrorCode>,
}

impl CaptureResult {
    pub fn metadata(sequence: u32, timestamp: Option<u64>) -> Self {
        CaptureResult {
            sequence,
            kind: ResultKind::Metadata { timestamp },
            error: None,
        }
    }

    pub fn pixel_buffer(sequence: u32, handle: BufferHandle) -> Self {
        CaptureResult {
            sequence,
            kind: ResultKind::PixelBuffer { handle },
            error: None,
        }
    }

    pub fn with_error(self, error: ErrorCode) -> Self {
        CaptureResult {
            error: Some(error),
            ..self
        }
    }
}

/// Asynchronous events reported by the driver outside of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMessage {
    Error { sequence: u32, code: ErrorCode },
    Shutter { sequence: u32, timestamp: u64 },
}

/// Receives the completions of the driver.
///
/// Methods can be called from any thread, including the one currently
/// calling `CaptureDriver::submit_request`.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: CaptureResult);
    fn notify(&self, message: NotifyMessage);
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver returned status {0}")]
    Status(#[from] Errno),
    #[error("driver is not initialized")]
    NotInitialized,
    #[error("driver error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// A capture device.
pub trait CaptureDriver: Send + Sync {
    /// Register the sink the driver reports its completions to. Must be
    /// called before anything else.
    fn initialize(&self, sink: Arc<dyn ResultSink>) -> Result<(), DriverError>;

    /// Build the default settings for requests of kind `template`.
    fn default_settings(&self, template: RequestTemplate) -> Result<RequestSettings, DriverError>;

    fn configure_streams(&self, config: &StreamConfiguration) -> Result<(), DriverError>;

    /// Queue `request` for capture. The results of the request may be
    /// reported to the sink before this method returns.
    fn submit_request(&self, request: CaptureRequest) -> Result<(), DriverError>;

    /// Block until every submitted request has either been completed or
    /// abandoned.
    fn flush(&self) -> Result<(), DriverError>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_result_builders() {
        let result = CaptureResult::metadata(4, Some(1000));
        assert_eq!(result.kind, ResultKind::Metadata { timestamp: Some(1000) });
        assert_eq!(result.error, None);

        let result = CaptureResult::pixel_buffer(4, BufferHandle(2)).with_error(ErrorCode::Buffer);
        assert_eq!(result.sequence, 4);
        assert_eq!(result.kind, ResultKind::PixelBuffer { handle: BufferHandle(2) });
        assert_eq!(result.error, Some(ErrorCode::Buffer));
    }

    #[test]
    fn test_driver_error_display() {
        assert_eq!(
            DriverError::from(Errno::EINVAL).to_string(),
            "driver returned status EINVAL: Invalid argument"
        );
        assert_eq!(ErrorCode::n(2), Some(ErrorCode::Request));
        assert_eq!(HalPixelFormat::n(0x23), Some(HalPixelFormat::YCbCr420_888));
    }
}
