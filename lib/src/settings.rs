//! Capture parameters and the per-request settings derived from them.
use bitflags::bitflags;
use enumn::N;

/// Auto-exposure mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum AeMode {
    Auto = 0,
    Manual = 1,
}

/// Power line frequency the auto-exposure should compensate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum Antibanding {
    Auto = 0,
    Hz50 = 1,
    Hz60 = 2,
    Off = 3,
}

/// Digital video stabilization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum VideoStabilization {
    Off = 0,
    On = 1,
}

/// Capture parameters set by the client.
///
/// They are not interpreted by the adapter beyond the derivation of the
/// stream operation mode: the driver receives them untouched in the
/// `RequestSettings` of every request.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Requested frame rate, in frames per second.
    pub fps: f32,
    /// Exposure compensation, in EV steps.
    pub ae_compensation: i32,
    pub ae_mode: AeMode,
    /// Exposure time in microseconds, only used in manual AE mode.
    pub exposure_time_us: i64,
    pub antibanding: Antibanding,
    pub video_stabilization: VideoStabilization,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            fps: 30.0,
            ae_compensation: 0,
            ae_mode: AeMode::Auto,
            exposure_time_us: 0,
            antibanding: Antibanding::Auto,
            video_stabilization: VideoStabilization::Off,
        }
    }
}

bitflags! {
    /// Operation mode of a stream, passed to the driver when configuring it.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OperationMode: u32 {
        const FPS_30 = 1 << 0;
        const FPS_60 = 1 << 1;
        const FPS_90 = 1 << 2;
        const FPS_120 = 1 << 3;
        const DVS = 1 << 8;
    }
}

impl OperationMode {
    /// Derive the operation mode matching `parameters`. Frame rates are
    /// rounded up to the next supported mode; rates outside of what we
    /// support leave the choice to the driver.
    ///
    /// # Examples
    ///
    /// ```
    /// # use camera_adapter::settings::{OperationMode, Parameters};
    /// let parameters = Parameters { fps: 45.0, ..Default::default() };
    /// assert_eq!(OperationMode::from_parameters(&parameters), OperationMode::FPS_60);
    /// ```
    pub fn from_parameters(parameters: &Parameters) -> Self {
        let fps = parameters.fps;
        let mut mode = if fps == 30.0 {
            OperationMode::FPS_30
        } else if fps > 30.0 && fps <= 60.0 {
            OperationMode::FPS_60
        } else if fps > 60.0 && fps <= 90.0 {
            OperationMode::FPS_90
        } else if fps > 90.0 && fps <= 120.0 {
            OperationMode::FPS_120
        } else {
            OperationMode::empty()
        };

        if parameters.video_stabilization == VideoStabilization::On {
            mode |= OperationMode::DVS;
        }

        mode
    }
}

/// Kind of request the driver should build default settings for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum RequestTemplate {
    Preview = 1,
    StillCapture = 2,
    VideoRecord = 3,
    VideoSnapshot = 4,
    ZeroShutterLag = 5,
    Manual = 6,
}

/// Settings attached to every capture request.
///
/// They are shared between all the requests dispatched while they are
/// current, so changing them only affects requests dispatched afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    pub template: RequestTemplate,
    /// Identifies the settings to the driver. Set to the template id.
    pub request_id: u32,
    pub parameters: Parameters,
}

impl RequestSettings {
    pub fn new(template: RequestTemplate) -> Self {
        RequestSettings {
            template,
            request_id: template as u32,
            parameters: Default::default(),
        }
    }

    /// Returns a copy of these settings carrying `parameters`.
    pub fn with_parameters(&self, parameters: Parameters) -> Self {
        RequestSettings {
            parameters,
            ..self.clone()
        }
    }
}
