//! Events: point-in-time markers recorded on a stream
//!
//! The device-side marker is created lazily on the first [`Event::record`]
//! and bound to that stream's device from then on. Recording again moves the
//! marker forward: waits enqueued earlier keep waiting for the instant that
//! was latest when they were enqueued, new waits bind to the new record.
//! An event that was never recorded is treated as already reached by
//! `query`, `synchronize` and `wait`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::backend::{EventFlags, EventId, IpcEventHandle};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::stream::Stream;

struct Marker {
    device: Device,
    id: EventId,
}

struct EventInner {
    runtime: Runtime,
    flags: EventFlags,
    marker: Mutex<Option<Marker>>,
}

impl Drop for EventInner {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.get_mut().take() {
            self.runtime.backend().destroy_event(marker.id);
        }
    }
}

/// Shared handle on one device event
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Fails with `InvalidConfig` when `interprocess` is combined with timing
    pub fn new(runtime: &Runtime, flags: EventFlags) -> Result<Self> {
        flags.validate()?;
        Ok(Self {
            inner: Arc::new(EventInner {
                runtime: runtime.clone(),
                flags,
                marker: Mutex::new(None),
            }),
        })
    }

    pub fn with_flags(
        runtime: &Runtime,
        enable_timing: bool,
        blocking_sync: bool,
        interprocess: bool,
    ) -> Result<Self> {
        Self::new(runtime, EventFlags::new(enable_timing, blocking_sync, interprocess))
    }

    /// Open an event exported by [`Event::ipc_handle`]
    pub fn from_ipc_handle(runtime: &Runtime, device: Device, handle: &IpcEventHandle) -> Result<Self> {
        runtime.check_device("Event::from_ipc_handle", device)?;
        let id = runtime.backend().import_event(device.index(), handle)?;
        Ok(Self {
            inner: Arc::new(EventInner {
                runtime: runtime.clone(),
                flags: EventFlags::shareable(),
                marker: Mutex::new(Some(Marker { device, id })),
            }),
        })
    }

    pub fn flags(&self) -> EventFlags {
        self.inner.flags
    }

    /// Device the marker lives on, once it exists
    pub fn device(&self) -> Option<Device> {
        self.inner.marker.lock().as_ref().map(|m| m.device)
    }

    pub fn is_recorded(&self) -> bool {
        self.inner.marker.lock().is_some()
    }

    fn marker_id(&self) -> Option<EventId> {
        self.inner.marker.lock().as_ref().map(|m| m.id)
    }

    /// Place the marker at the current end of `stream`
    pub fn record(&self, stream: &Stream) -> Result<()> {
        let op = "Event::record";
        if !self.inner.runtime.same(stream.runtime()) {
            return Err(Error::invalid_config(op, "stream belongs to a different runtime"));
        }
        let mut marker = self.inner.marker.lock();
        let id = match marker.as_ref() {
            Some(m) if m.device != stream.device() => {
                return Err(Error::invalid_device(
                    op,
                    stream.device(),
                    format!("event was first recorded on {}", m.device),
                ));
            }
            Some(m) => m.id,
            None => {
                let id = self
                    .inner
                    .runtime
                    .backend()
                    .create_event(stream.device_index(), self.inner.flags)?;
                *marker = Some(Marker {
                    device: stream.device(),
                    id,
                });
                id
            }
        };
        trace!(event = id.0, stream = stream.id(), "Recording event");
        self.inner.runtime.backend().record_event(id, stream.raw_queue())
    }

    /// `true` once the device has reached the latest record. Never blocks.
    pub fn query(&self) -> Result<bool> {
        match self.marker_id() {
            Some(id) => self.inner.runtime.backend().query_event(id),
            None => Ok(true),
        }
    }

    /// Block the calling thread until the latest record has been reached
    pub fn synchronize(&self) -> Result<()> {
        match self.marker_id() {
            Some(id) => self.inner.runtime.backend().synchronize_event(id),
            None => Ok(()),
        }
    }

    /// Make later work on `stream` wait for this event without blocking the host
    pub fn wait(&self, stream: &Stream) -> Result<()> {
        if !self.inner.runtime.same(stream.runtime()) {
            return Err(Error::invalid_config(
                "Event::wait",
                "stream belongs to a different runtime",
            ));
        }
        match self.marker_id() {
            Some(id) => self
                .inner
                .runtime
                .backend()
                .queue_wait_event(stream.raw_queue(), id),
            None => Ok(()),
        }
    }

    /// Milliseconds of device time between this event and `end`
    pub fn elapsed_time(&self, end: &Event) -> Result<f64> {
        let op = "Event::elapsed_time";
        if !self.inner.flags.enable_timing || !end.inner.flags.enable_timing {
            return Err(Error::TimingDisabled { op });
        }
        let (Some(start_id), Some(end_id)) = (self.marker_id(), end.marker_id()) else {
            return Err(Error::NotReady { op });
        };
        if !self.query()? || !end.query()? {
            return Err(Error::NotReady { op });
        }
        self.inner.runtime.backend().elapsed_time(start_id, end_id)
    }

    /// Export a fixed-size handle another process can open
    ///
    /// An event not yet recorded gets its marker on the calling thread's
    /// current device.
    pub fn ipc_handle(&self) -> Result<IpcEventHandle> {
        let op = "Event::ipc_handle";
        if !self.inner.flags.interprocess {
            return Err(Error::not_shareable(op, "event created without interprocess flag"));
        }
        let mut marker = self.inner.marker.lock();
        let id = match marker.as_ref() {
            Some(m) => m.id,
            None => {
                let device = self.inner.runtime.current_device();
                let id = self
                    .inner
                    .runtime
                    .backend()
                    .create_event(device.index(), self.inner.flags)?;
                *marker = Some(Marker { device, id });
                id
            }
        };
        self.inner.runtime.backend().export_event(id)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("flags", &self.inner.flags)
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::ErrorKind;
    use crate::sim::SimBackend;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        let backend = Arc::new(SimBackend::with_devices(2).unwrap());
        let config = RuntimeConfig {
            streams_per_priority: 2,
            ..RuntimeConfig::default()
        };
        Runtime::new(backend, config).unwrap()
    }

    fn hold(stream: &Stream) -> Arc<AtomicBool> {
        let gate = Arc::new(AtomicBool::new(false));
        let open = Arc::clone(&gate);
        stream
            .launch_host_fn(move || {
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        gate
    }

    #[test]
    fn test_interprocess_timing_is_invalid() {
        let rt = runtime();
        let err = Event::with_flags(&rt, true, false, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_unrecorded_event_is_satisfied() {
        let rt = runtime();
        let event = Event::new(&rt, EventFlags::default()).unwrap();
        assert!(event.query().unwrap());
        event.synchronize().unwrap();
        let stream = rt.stream(None, 0).unwrap();
        event.wait(&stream).unwrap();
        stream.synchronize().unwrap();
        assert!(event.device().is_none());
    }

    #[test]
    fn test_query_true_after_synchronize() {
        let rt = runtime();
        let stream = rt.stream(None, 0).unwrap();
        let gate = hold(&stream);
        let event = stream.record_event(None).unwrap();
        assert!(!event.query().unwrap());
        gate.store(true, Ordering::SeqCst);
        event.synchronize().unwrap();
        assert!(event.query().unwrap());
    }

    #[test]
    fn test_record_binds_device() {
        let rt = runtime();
        let event = Event::new(&rt, EventFlags::default()).unwrap();
        let s0 = rt.stream(Some(rt.device(0)), 0).unwrap();
        let s1 = rt.stream(Some(rt.device(1)), 0).unwrap();
        event.record(&s0).unwrap();
        assert_eq!(event.device(), Some(rt.device(0)));
        assert_eq!(event.record(&s1).unwrap_err().kind(), ErrorKind::InvalidDevice);
    }

    #[test]
    fn test_elapsed_time() {
        let rt = runtime();
        let stream = rt.stream(None, 0).unwrap();
        let start = Event::new(&rt, EventFlags::timing()).unwrap();
        let end = Event::new(&rt, EventFlags::timing()).unwrap();

        assert_eq!(start.elapsed_time(&end).unwrap_err().kind(), ErrorKind::NotReady);

        start.record(&stream).unwrap();
        stream
            .launch_host_fn(|| std::thread::sleep(Duration::from_millis(15)))
            .unwrap();
        end.record(&stream).unwrap();
        end.synchronize().unwrap();

        let ms = start.elapsed_time(&end).unwrap();
        assert!(ms >= 10.0, "elapsed {} ms", ms);
    }

    #[test]
    fn test_elapsed_time_requires_timing() {
        let rt = runtime();
        let stream = rt.stream(None, 0).unwrap();
        let plain = stream.record_event(None).unwrap();
        let timed = stream
            .record_event(Some(Event::new(&rt, EventFlags::timing()).unwrap()))
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(
            plain.elapsed_time(&timed).unwrap_err().kind(),
            ErrorKind::TimingDisabled
        );
    }

    #[test]
    fn test_elapsed_time_not_ready() {
        let rt = runtime();
        let stream = rt.stream(None, 0).unwrap();
        let start = stream
            .record_event(Some(Event::new(&rt, EventFlags::timing()).unwrap()))
            .unwrap();
        let gate = hold(&stream);
        let end = stream
            .record_event(Some(Event::new(&rt, EventFlags::timing()).unwrap()))
            .unwrap();
        assert_eq!(start.elapsed_time(&end).unwrap_err().kind(), ErrorKind::NotReady);
        gate.store(true, Ordering::SeqCst);
        stream.synchronize().unwrap();
        assert!(start.elapsed_time(&end).is_ok());
    }

    #[test]
    fn test_ipc_handle_roundtrip() {
        let rt = runtime();
        let plain = Event::new(&rt, EventFlags::default()).unwrap();
        assert_eq!(plain.ipc_handle().unwrap_err().kind(), ErrorKind::NotShareable);

        let shared = Event::new(&rt, EventFlags::shareable()).unwrap();
        let handle = shared.ipc_handle().unwrap();
        let bytes = handle.as_bytes().to_vec();

        let handle = IpcEventHandle::from_bytes(&bytes).unwrap();
        let opened = Event::from_ipc_handle(&rt, rt.device(0), &handle).unwrap();

        let stream = rt.stream(Some(rt.device(0)), 0).unwrap();
        let gate = hold(&stream);
        shared.record(&stream).unwrap();
        assert!(!opened.query().unwrap());
        gate.store(true, Ordering::SeqCst);
        opened.synchronize().unwrap();
        assert!(shared.query().unwrap());
    }

    #[test]
    fn test_rerecord_keeps_earlier_wait() {
        let rt = runtime();
        let producer = rt.stream(Some(rt.device(0)), 0).unwrap();
        let consumer = rt.stream(Some(rt.device(0)), -1).unwrap();
        let event = Event::new(&rt, EventFlags::default()).unwrap();

        let first = hold(&producer);
        event.record(&producer).unwrap();
        consumer.wait_event(&event).unwrap();

        // Moves the marker to an instant that completes immediately after the first hold
        event.record(&producer).unwrap();
        assert!(!consumer.query().unwrap());

        first.store(true, Ordering::SeqCst);
        consumer.synchronize().unwrap();
        assert!(event.query().unwrap());
    }
}
