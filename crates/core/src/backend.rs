//! Device runtime capability interface
//!
//! Everything above this trait (streams, events, guards, buffers, scatter and
//! gather) is written once against [`DeviceBackend`]. A backend owns the
//! device-side objects; the rest of the crate only holds the small integer
//! handles defined here.
//!
//! ```text
//! Runtime
//! ├── DeviceBackend (queues, events, allocations, copies)
//! ├── StreamPool per device (priority classes, round-robin leases)
//! └── per-thread context (current device, current stream per device)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::device::DeviceKind;
use crate::error::{Error, Result};

/// Size in bytes of an exported interprocess event handle
pub const IPC_HANDLE_SIZE: usize = 64;

/// Backend handle of one command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u64);

/// Backend handle of one device-side event marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Backend handle of one device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

/// One contiguous byte range moved by a device copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRun {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub len: usize,
}

/// Creation flags of an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFlags {
    pub enable_timing: bool,
    pub blocking_sync: bool,
    pub interprocess: bool,
}

impl EventFlags {
    pub fn new(enable_timing: bool, blocking_sync: bool, interprocess: bool) -> Self {
        Self {
            enable_timing,
            blocking_sync,
            interprocess,
        }
    }

    pub fn timing() -> Self {
        Self {
            enable_timing: true,
            ..Self::default()
        }
    }

    pub fn shareable() -> Self {
        Self {
            interprocess: true,
            ..Self::default()
        }
    }

    /// An interprocess event cannot carry timing information
    pub fn validate(&self) -> Result<()> {
        if self.interprocess && self.enable_timing {
            return Err(Error::invalid_config(
                "Event::new",
                "interprocess events cannot be timing-enabled",
            ));
        }
        Ok(())
    }
}

/// Fixed-size opaque blob naming an event across processes
///
/// The layout is backend-defined; callers move it around as bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcEventHandle([u8; IPC_HANDLE_SIZE]);

impl IpcEventHandle {
    pub fn from_array(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; IPC_HANDLE_SIZE] = bytes.try_into().map_err(|_| {
            Error::not_shareable(
                "IpcEventHandle::from_bytes",
                format!("expected {} bytes, got {}", IPC_HANDLE_SIZE, bytes.len()),
            )
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for IpcEventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex: String = self.0[..8].iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "IpcEventHandle({}..)", hex)
    }
}

/// Host callback run in stream order
pub type HostFn = Box<dyn FnOnce() + Send + 'static>;

/// Device runtime capabilities consumed by the rest of the crate
///
/// Enqueue methods return as soon as the work is queued; only the
/// `synchronize_*` methods and [`DeviceBackend::read`] may block the caller.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    fn device_kind(&self) -> DeviceKind;

    fn device_count(&self) -> usize;

    /// `(least, greatest)` stream priority; lower numbers are more urgent
    fn priority_range(&self) -> (i32, i32);

    fn create_queue(&self, device: usize, priority: i32) -> Result<QueueId>;

    /// Release a queue. Work already enqueued still runs to completion.
    fn destroy_queue(&self, queue: QueueId);

    /// `true` once everything enqueued on `queue` before the call has finished
    fn query_queue(&self, queue: QueueId) -> Result<bool>;

    fn synchronize_queue(&self, queue: QueueId) -> Result<()>;

    fn allocate(&self, device: usize, nbytes: usize) -> Result<AllocationId>;

    fn free(&self, allocation: AllocationId);

    /// Enqueue a device copy of `runs` from `src` into `dst`
    fn enqueue_copy(
        &self,
        queue: QueueId,
        src: AllocationId,
        dst: AllocationId,
        runs: &[CopyRun],
    ) -> Result<()>;

    /// Enqueue a host-to-device write of `data` at `offset` in `dst`
    fn enqueue_write(
        &self,
        queue: QueueId,
        dst: AllocationId,
        offset: usize,
        data: Vec<u8>,
    ) -> Result<()>;

    /// Read bytes straight from device memory. Callers synchronize first.
    fn read(&self, allocation: AllocationId, offset: usize, len: usize) -> Result<Vec<u8>>;

    fn enqueue_host_fn(&self, queue: QueueId, f: HostFn) -> Result<()>;

    fn create_event(&self, device: usize, flags: EventFlags) -> Result<EventId>;

    fn destroy_event(&self, event: EventId);

    /// Move the event's marker to the current end of `queue`
    fn record_event(&self, event: EventId, queue: QueueId) -> Result<()>;

    /// `true` if the latest record has been reached, or if nothing was recorded
    fn query_event(&self, event: EventId) -> Result<bool>;

    fn synchronize_event(&self, event: EventId) -> Result<()>;

    /// Make later work on `queue` wait for the event's latest record
    fn queue_wait_event(&self, queue: QueueId, event: EventId) -> Result<()>;

    /// Milliseconds between the completed records of `start` and `end`
    fn elapsed_time(&self, start: EventId, end: EventId) -> Result<f64>;

    fn export_event(&self, event: EventId) -> Result<IpcEventHandle>;

    fn import_event(&self, device: usize, handle: &IpcEventHandle) -> Result<EventId>;
}
