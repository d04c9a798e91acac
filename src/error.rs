use thiserror::Error;

/// Errors surfaced by the calibration core.
///
/// Recoverable per-item failures (a bootstrap pair with no shared frames, a
/// rejected PnP solve) are not represented here — they are logged and
/// silently dropped at the call site. This enum is reserved for conditions
/// that make the caller's request impossible to satisfy.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("insufficient data: {0}")]
    InsufficientData(&'static str),

    #[error("optimization failed: {0}")]
    OptimizationFailure(&'static str),

    #[error("camera {port} has no intrinsics")]
    MissingIntrinsics { port: i64 },

    #[error("unknown camera port {port}")]
    UnknownCamera { port: i64 },

    #[error("SVD failed to converge")]
    SvdFailed,

    #[error("cam_geom::Error: {source}")]
    CamGeom {
        #[from]
        source: cam_geom::Error,
    },

    #[error("opencv_ros_camera::Error: {source}")]
    OpencvRosCamera {
        #[from]
        source: opencv_ros_camera::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;
