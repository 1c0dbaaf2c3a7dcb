//! Device-resident buffers with explicit last-writer tracking
//!
//! A [`Buffer`] is a strided view over one device allocation. Every write
//! issued through this module records a [`Fence`] (a fresh event plus the
//! stream it was recorded on) on the allocation, and every read or write
//! issued on another stream waits for that fence first:
//!
//! ```text
//! producer stream:  write(B) ── record fence(B)
//!                                      │ wait
//! consumer stream:                     └──► copy from B ── record fence(out)
//! ```
//!
//! Views created with [`Buffer::narrow`] or [`Buffer::unsqueeze`] share the
//! allocation and therefore its fence.

use bytemuck::Pod;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::backend::AllocationId;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::layout::{copy_runs, Layout};
use crate::runtime::Runtime;
use crate::stream::Stream;

/// The event recorded after the most recent write to an allocation, and the
/// stream that write was issued on
#[derive(Clone, Debug)]
pub struct Fence {
    event: Event,
    stream: Stream,
}

impl Fence {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.event.query()
    }

    pub fn synchronize(&self) -> Result<()> {
        self.event.synchronize()
    }
}

struct Storage {
    runtime: Runtime,
    device: Device,
    allocation: AllocationId,
    nbytes: usize,
    fence: Mutex<Option<Fence>>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.runtime.backend().free(self.allocation);
    }
}

#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    layout: Layout,
    elem_size: usize,
}

impl Buffer {
    /// Allocate an uninitialized (zeroed on the simulated backend) buffer
    pub fn empty(runtime: &Runtime, device: Device, shape: &[usize], elem_size: usize) -> Result<Self> {
        runtime.check_device("Buffer::empty", device)?;
        if elem_size == 0 {
            return Err(Error::invalid_config("Buffer::empty", "element size must be non-zero"));
        }
        let layout = Layout::contiguous(shape);
        let nbytes = layout.numel() * elem_size;
        let allocation = runtime.backend().allocate(device.index(), nbytes)?;
        Ok(Self {
            storage: Arc::new(Storage {
                runtime: runtime.clone(),
                device,
                allocation,
                nbytes,
                fence: Mutex::new(None),
            }),
            layout,
            elem_size,
        })
    }

    /// Allocate and fill from host bytes, asynchronously on `stream` (the
    /// device's current stream when `None`)
    pub fn from_bytes(
        runtime: &Runtime,
        device: Device,
        shape: &[usize],
        elem_size: usize,
        data: &[u8],
        stream: Option<&Stream>,
    ) -> Result<Self> {
        let buffer = Self::empty(runtime, device, shape, elem_size)?;
        if data.len() != buffer.nbytes() {
            return Err(Error::shape_mismatch(
                "Buffer::from_bytes",
                format!("{:?} needs {} bytes, got {}", shape, buffer.nbytes(), data.len()),
            ));
        }
        let stream = match stream {
            Some(stream) => stream.clone(),
            None => runtime.current_stream(Some(device))?,
        };
        if stream.device() != device {
            return Err(Error::invalid_device(
                "Buffer::from_bytes",
                stream.device(),
                format!("buffer lives on {}", device),
            ));
        }
        runtime
            .backend()
            .enqueue_write(stream.raw_queue(), buffer.storage.allocation, 0, data.to_vec())?;
        buffer.mark_written(&stream)?;
        Ok(buffer)
    }

    pub fn from_slice<T: Pod>(runtime: &Runtime, device: Device, shape: &[usize], data: &[T]) -> Result<Self> {
        Self::from_bytes(
            runtime,
            device,
            shape,
            std::mem::size_of::<T>(),
            bytemuck::cast_slice(data),
            None,
        )
    }

    pub fn runtime(&self) -> &Runtime {
        &self.storage.runtime
    }

    pub fn device(&self) -> Device {
        self.storage.device
    }

    pub fn raw_handle(&self) -> AllocationId {
        self.storage.allocation
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn numel(&self) -> usize {
        self.layout.numel()
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Bytes covered by this view
    pub fn nbytes(&self) -> usize {
        self.numel() * self.elem_size
    }

    /// Bytes of the whole underlying allocation
    pub fn allocation_bytes(&self) -> usize {
        self.storage.nbytes
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            storage: Arc::clone(&self.storage),
            layout: self.layout.narrow(dim, start, len)?,
            elem_size: self.elem_size,
        })
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(Self {
            storage: Arc::clone(&self.storage),
            layout: self.layout.unsqueeze(dim)?,
            elem_size: self.elem_size,
        })
    }

    pub fn last_writer(&self) -> Option<Fence> {
        self.storage.fence.lock().clone()
    }

    /// Make later work on `stream` wait for the last write to this buffer
    ///
    /// Without a recorded fence the buffer's device current stream is taken
    /// as the writer.
    pub fn wait_for_writer(&self, stream: &Stream) -> Result<()> {
        match self.last_writer() {
            Some(fence) if fence.stream() == stream => Ok(()),
            Some(fence) => fence.event().wait(stream),
            None => {
                let writer = self.runtime().current_stream(Some(self.device()))?;
                stream.wait_stream(&writer)
            }
        }
    }

    /// Record a fence on `stream` marking it as this allocation's last writer
    pub fn mark_written(&self, stream: &Stream) -> Result<Fence> {
        let event = stream.record_event(None)?;
        let fence = Fence {
            event,
            stream: stream.clone(),
        };
        *self.storage.fence.lock() = Some(fence.clone());
        Ok(fence)
    }

    /// Enqueue a copy of `src` into this view on `stream`, after waiting for
    /// the last writers of both. Does not record a fence.
    pub fn enqueue_copy_from(&self, src: &Buffer, stream: &Stream) -> Result<()> {
        let op = "Buffer::copy_from";
        if !self.runtime().same(src.runtime()) || !self.runtime().same(stream.runtime()) {
            return Err(Error::invalid_config(op, "buffers and stream belong to different runtimes"));
        }
        if self.elem_size != src.elem_size {
            return Err(Error::shape_mismatch(
                op,
                format!("element size {} vs {}", src.elem_size, self.elem_size),
            ));
        }
        let runs = copy_runs(&src.layout, &self.layout, self.elem_size)?;
        src.wait_for_writer(stream)?;
        self.wait_for_writer(stream)?;
        if runs.is_empty() {
            return Ok(());
        }
        trace!(
            src = %src.device(),
            dst = %self.device(),
            stream = stream.id(),
            runs = runs.len(),
            "Enqueue buffer copy"
        );
        self.runtime().backend().enqueue_copy(
            stream.raw_queue(),
            src.storage.allocation,
            self.storage.allocation,
            &runs,
        )
    }

    /// Copy `src` into this view on `stream` and record the new fence
    pub fn copy_from(&self, src: &Buffer, stream: &Stream) -> Result<Fence> {
        self.enqueue_copy_from(src, stream)?;
        self.mark_written(stream)
    }

    /// Wait for the last writer, then read this view into host memory in
    /// row-major order
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.last_writer() {
            Some(fence) => fence.synchronize()?,
            None => self.runtime().current_stream(Some(self.device()))?.synchronize()?,
        }
        let packed = Layout::contiguous(self.shape());
        let runs = copy_runs(&self.layout, &packed, self.elem_size)?;
        let mut out = vec![0u8; self.nbytes()];
        for run in runs {
            let bytes = self
                .runtime()
                .backend()
                .read(self.storage.allocation, run.src_offset, run.len)?;
            out[run.dst_offset..run.dst_offset + run.len].copy_from_slice(&bytes);
        }
        Ok(out)
    }

    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        if std::mem::size_of::<T>() != self.elem_size {
            return Err(Error::shape_mismatch(
                "Buffer::to_vec",
                format!(
                    "element size {} vs requested {}",
                    self.elem_size,
                    std::mem::size_of::<T>()
                ),
            ));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.to_bytes()?))
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.storage.device)
            .field("shape", &self.layout.shape())
            .field("strides", &self.layout.strides())
            .field("elem_size", &self.elem_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::ErrorKind;
    use crate::sim::SimBackend;

    fn runtime() -> (Runtime, Arc<SimBackend>) {
        let backend = Arc::new(SimBackend::with_devices(2).unwrap());
        let config = RuntimeConfig {
            streams_per_priority: 2,
            ..RuntimeConfig::default()
        };
        (Runtime::new(backend.clone(), config).unwrap(), backend)
    }

    #[test]
    fn test_from_slice_records_fence() {
        let (rt, _) = runtime();
        let buffer = Buffer::from_slice(&rt, rt.device(0), &[2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let fence = buffer.last_writer().unwrap();
        assert_eq!(fence.stream().device(), rt.device(0));
        assert_eq!(buffer.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(fence.is_complete().unwrap());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let (rt, backend) = runtime();
        let err = Buffer::from_slice(&rt, rt.device(0), &[3], &[1u32, 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_cross_device_copy_waits_for_writer() {
        let (rt, _) = runtime();
        let src = Buffer::from_slice(&rt, rt.device(0), &[4], &[7u16, 8, 9, 10]).unwrap();
        let dst = Buffer::empty(&rt, rt.device(1), &[4], 2).unwrap();
        let stream = rt.stream(Some(rt.device(1)), 0).unwrap();
        let fence = dst.copy_from(&src, &stream).unwrap();
        assert_eq!(fence.stream(), &stream);
        assert_eq!(dst.to_vec::<u16>().unwrap(), vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_strided_view_reads_in_order() {
        let (rt, _) = runtime();
        let data: Vec<i32> = (0..12).collect();
        let buffer = Buffer::from_slice(&rt, rt.device(0), &[3, 4], &data).unwrap();
        let column = buffer.narrow(1, 1, 2).unwrap();
        assert!(!column.is_contiguous());
        assert!(column.shares_storage(&buffer));
        assert_eq!(column.to_vec::<i32>().unwrap(), vec![1, 2, 5, 6, 9, 10]);
    }

    #[test]
    fn test_zero_sized_buffer() {
        let (rt, _) = runtime();
        let empty = Buffer::empty(&rt, rt.device(1), &[0, 5], 4).unwrap();
        assert_eq!(empty.nbytes(), 0);
        assert!(empty.to_vec::<f32>().unwrap().is_empty());
    }

    #[test]
    fn test_storage_freed_on_drop() {
        let (rt, backend) = runtime();
        let buffer = Buffer::empty(&rt, rt.device(0), &[16], 4).unwrap();
        let view = buffer.narrow(0, 0, 4).unwrap();
        drop(buffer);
        assert_eq!(backend.live_allocations(), 1);
        drop(view);
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_element_size_mismatch() {
        let (rt, _) = runtime();
        let buffer = Buffer::from_slice(&rt, rt.device(0), &[2], &[1u64, 2]).unwrap();
        assert_eq!(buffer.to_vec::<u32>().unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }
}
