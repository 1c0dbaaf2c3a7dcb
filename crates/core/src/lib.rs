//! Multi-device streams, events and device guards
//!
//! A [`Runtime`] owns one [`DeviceBackend`] and per-device stream pools.
//! Work is enqueued on [`Stream`]s; cross-stream ordering is expressed with
//! [`Event`]s and the last-writer [`Fence`] every [`Buffer`] carries.
//! [`SimBackend`] runs each queue on a host worker thread and is what the
//! tests and benches drive.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod guard;
pub mod layout;
pub mod pool;
pub mod runtime;
pub mod sim;
pub mod stream;

pub use backend::{
    AllocationId, CopyRun, DeviceBackend, EventFlags, EventId, HostFn, IpcEventHandle, QueueId,
    IPC_HANDLE_SIZE,
};
pub use buffer::{Buffer, Fence};
pub use config::{RuntimeConfig, SimConfig, RUNTIME_CONFIG_ENV, SIM_CONFIG_ENV};
pub use device::{Device, DeviceKind};
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
pub use guard::{DeviceGuard, StreamGuard};
pub use layout::Layout;
pub use pool::PriorityClass;
pub use runtime::Runtime;
pub use sim::{Fault, SimBackend};
pub use stream::Stream;
