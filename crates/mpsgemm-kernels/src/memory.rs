//! Device memory for the emulated runtime.
//!
//! A [`DeviceBuffer`] is shared between the host and queued kernels, so it
//! is reference counted and guarded by a lock. Reading it from the host is
//! only meaningful after the stream that writes it has been synchronized.

use crate::element::Element;
use mpsgemm_common::{MpsgemmError, Result};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Column-major storage footprint of a `rows x cols` matrix with leading dimension `ld`.
pub fn matrix_span(rows: usize, cols: usize, ld: usize) -> Option<usize> {
    if rows == 0 || cols == 0 {
        return Some(0);
    }
    (cols - 1).checked_mul(ld)?.checked_add(rows)
}

/// Footprint of `batch` matrices of footprint `span` placed `stride` apart.
pub fn batch_span(span: usize, stride: usize, batch: usize) -> Option<usize> {
    if batch == 0 {
        return Some(0);
    }
    (batch - 1).checked_mul(stride)?.checked_add(span)
}

/// Device-resident element buffer.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    data: Arc<RwLock<Vec<T>>>,
    len: usize,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self { data: Arc::clone(&self.data), len: self.len }
    }
}

fn allocate<T: Clone>(len: usize, fill: T, what: &'static str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| MpsgemmError::Allocation { what, size: len })?;
    v.resize(len, fill);
    Ok(v)
}

impl<T: Element> DeviceBuffer<T> {
    /// Allocate `len` zeroed elements.
    pub fn zeros(len: usize) -> Result<Self> {
        let data = allocate(len, T::zero(), "device buffer")?;
        Ok(Self { data: Arc::new(RwLock::new(data)), len })
    }

    /// Allocate and upload `host`.
    pub fn from_slice(host: &[T]) -> Result<Self> {
        let buf = Self::zeros(host.len())?;
        buf.write().copy_from_slice(host);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the first element.
    pub fn ptr(&self) -> DevicePtr<T> {
        DevicePtr { buffer: self.clone(), offset: 0 }
    }

    /// Download the whole buffer.
    pub fn to_host(&self) -> Vec<T> {
        self.read().clone()
    }

    /// Overwrite the buffer from host memory.
    pub fn copy_from_host(&self, host: &[T]) -> Result<()> {
        if host.len() != self.len {
            return Err(MpsgemmError::InvalidArgument(format!(
                "host slice has {} elements, buffer has {}",
                host.len(),
                self.len
            )));
        }
        self.write().copy_from_slice(host);
        Ok(())
    }

    pub(crate) fn read_span(&self, offset: usize, len: usize) -> Vec<T> {
        self.read()[offset..offset + len].to_vec()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Element offset into a [`DeviceBuffer`].
#[derive(Debug)]
pub struct DevicePtr<T> {
    buffer: DeviceBuffer<T>,
    offset: usize,
}

impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        Self { buffer: self.buffer.clone(), offset: self.offset }
    }
}

impl<T: Element> DevicePtr<T> {
    /// Pointer `count` elements further along.
    pub fn add(&self, count: usize) -> Self {
        Self { buffer: self.buffer.clone(), offset: self.offset + count }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn buffer(&self) -> &DeviceBuffer<T> {
        &self.buffer
    }

    /// Elements addressable from this pointer.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    /// Fail unless `span` elements are addressable.
    pub fn check_span(&self, name: &str, span: usize) -> Result<()> {
        if span > self.remaining() {
            return Err(MpsgemmError::InvalidArgument(format!(
                "{name} needs {span} elements from offset {}, buffer has {}",
                self.offset,
                self.buffer.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn read_span(&self, len: usize) -> Vec<T> {
        self.buffer.read_span(self.offset, len)
    }
}
