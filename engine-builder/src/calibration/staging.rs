use std::sync::Arc;

use tracing::{trace, warn};

use super::device::{Device, DeviceError, DevicePtr};

/// A fixed-size device allocation holding one calibration batch.
///
/// The allocation is released when the buffer is dropped.
pub struct StagingBuffer {
    device: Arc<dyn Device>,
    ptr: DevicePtr,
    size: usize,
}

impl StagingBuffer {
    pub fn allocate(device: Arc<dyn Device>, size: usize) -> Result<Self, DeviceError> {
        let ptr = device.malloc(size)?;
        trace!("allocated {size} bytes staging buffer at {ptr} on {}", device.name());
        Ok(Self { device, ptr, size })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Overwrites the whole buffer with `batch`, which must be exactly the buffer size.
    pub fn upload(&mut self, batch: &[u8]) -> Result<(), DeviceError> {
        if batch.len() != self.size {
            return Err(DeviceError::SizeMismatch {
                expected: self.size,
                actual: batch.len(),
            });
        }
        self.device.memcpy_htod(self.ptr, batch)
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        match self.device.free(self.ptr) {
            Ok(()) => trace!("released staging buffer at {}", self.ptr),
            Err(e) => warn!("failed to release staging buffer at {}: {e}", self.ptr),
        }
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("device", &self.device.name())
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
