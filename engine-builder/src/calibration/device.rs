//! Device memory as seen by the calibrator and the backend.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

/// Opaque address of a device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{_0:#x}")]
pub struct DevicePtr(pub u64);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("invalid device pointer {0}")]
    InvalidPointer(DevicePtr),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("device state is poisoned")]
    Poisoned,
}

/// Minimal device memory interface: allocation and synchronous copies.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;
    fn malloc(&self, size: usize) -> Result<DevicePtr, DeviceError>;
    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;
    /// Copies `src` to the start of the allocation at `dst`.
    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError>;
    /// Copies the first `len` bytes of the allocation at `src`.
    fn memcpy_dtoh(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>, DeviceError>;
}

// keeps emulated addresses away from null and aligned like device allocations
const HOST_BASE_ADDRESS: u64 = 0x7000_0000;
const HOST_ALIGNMENT: u64 = 256;

/// A [`Device`] backed by host memory.
#[derive(Debug)]
pub struct HostDevice {
    allocations: Mutex<HashMap<DevicePtr, Vec<u8>>>,
    next_address: AtomicU64,
    capacity: Option<usize>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(HOST_BASE_ADDRESS),
            capacity: None,
        }
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total number of bytes that can be allocated at once.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().map(|a| a.len()).unwrap_or_default()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocations
            .lock()
            .map(|a| a.values().map(Vec::len).sum())
            .unwrap_or_default()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn malloc(&self, size: usize) -> Result<DevicePtr, DeviceError> {
        let mut allocations = self.allocations.lock().map_err(|_| DeviceError::Poisoned)?;
        if let Some(capacity) = self.capacity {
            let used: usize = allocations.values().map(Vec::len).sum();
            let available = capacity.saturating_sub(used);
            if size > available {
                return Err(DeviceError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }
        let stride = (size as u64).div_ceil(HOST_ALIGNMENT).max(1) * HOST_ALIGNMENT;
        let ptr = DevicePtr(self.next_address.fetch_add(stride, Ordering::Relaxed));
        allocations.insert(ptr, vec![0u8; size]);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut allocations = self.allocations.lock().map_err(|_| DeviceError::Poisoned)?;
        allocations
            .remove(&ptr)
            .map(|_| ())
            .ok_or(DeviceError::InvalidPointer(ptr))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DeviceError> {
        let mut allocations = self.allocations.lock().map_err(|_| DeviceError::Poisoned)?;
        let buffer = allocations
            .get_mut(&dst)
            .ok_or(DeviceError::InvalidPointer(dst))?;
        if src.len() > buffer.len() {
            return Err(DeviceError::SizeMismatch {
                expected: buffer.len(),
                actual: src.len(),
            });
        }
        buffer[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_dtoh(&self, src: DevicePtr, len: usize) -> Result<Vec<u8>, DeviceError> {
        let allocations = self.allocations.lock().map_err(|_| DeviceError::Poisoned)?;
        let buffer = allocations
            .get(&src)
            .ok_or(DeviceError::InvalidPointer(src))?;
        if len > buffer.len() {
            return Err(DeviceError::SizeMismatch {
                expected: buffer.len(),
                actual: len,
            });
        }
        Ok(buffer[..len].to_vec())
    }
}
