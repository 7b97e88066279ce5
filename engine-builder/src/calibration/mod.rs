//! INT8 calibration: the calibrator protocol driven by a build backend, the device staging
//! buffer it feeds and the on-disk calibration cache.

mod cache;
mod calibrator;
mod device;
mod staging;

pub use cache::CalibrationCache;
pub use calibrator::{CalibrationProgress, EngineCalibrator, Int8Calibrator};
pub use device::{Device, DeviceError, DevicePtr, HostDevice};
pub use staging::StagingBuffer;
