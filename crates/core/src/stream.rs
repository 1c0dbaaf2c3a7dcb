//! Streams: ordered asynchronous command queues on one device
//!
//! A [`Stream`] is a shared, non-owning handle on a backend queue. Pooled
//! streams lease a slot of their device's pool and give it back when the
//! last clone is dropped; external streams wrap a queue the caller created
//! and never destroy it.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::trace;

use crate::backend::{HostFn, QueueId};
use crate::device::Device;
use crate::error::Result;
use crate::event::Event;
use crate::pool::{PoolSlot, PriorityClass};
use crate::runtime::Runtime;

enum Origin {
    Pooled(Arc<PoolSlot>),
    External,
}

struct StreamInner {
    runtime: Runtime,
    device: Device,
    queue: QueueId,
    priority: i32,
    origin: Origin,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if let Origin::Pooled(slot) = &self.origin {
            slot.release();
        }
    }
}

/// A stream without its runtime handle, as held in per-thread context.
/// Holds no lease.
#[derive(Clone)]
pub(crate) struct DetachedStream {
    device: Device,
    queue: QueueId,
    priority: i32,
    slot: Option<Arc<PoolSlot>>,
}

#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn pooled(runtime: Runtime, device: Device, slot: Arc<PoolSlot>, priority: i32) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                runtime,
                device,
                queue: slot.queue(),
                priority,
                origin: Origin::Pooled(slot),
            }),
        }
    }

    /// Wrap a queue created outside the runtime's pools
    ///
    /// The queue must already exist on `device`; dropping the wrapper leaves
    /// it alive.
    pub fn from_external(runtime: &Runtime, raw: QueueId, device: Device) -> Result<Self> {
        runtime.check_device("Stream::from_external", device)?;
        runtime.backend().query_queue(raw)?;
        Ok(Self {
            inner: Arc::new(StreamInner {
                runtime: runtime.clone(),
                device,
                queue: raw,
                priority: runtime.backend().priority_range().0,
                origin: Origin::External,
            }),
        })
    }

    pub(crate) fn detach(&self) -> DetachedStream {
        DetachedStream {
            device: self.inner.device,
            queue: self.inner.queue,
            priority: self.inner.priority,
            slot: match &self.inner.origin {
                Origin::Pooled(slot) => Some(Arc::clone(slot)),
                Origin::External => None,
            },
        }
    }

    pub(crate) fn attach(runtime: &Runtime, detached: &DetachedStream) -> Self {
        let origin = match &detached.slot {
            Some(slot) => Origin::Pooled(slot.lease()),
            None => Origin::External,
        };
        Self {
            inner: Arc::new(StreamInner {
                runtime: runtime.clone(),
                device: detached.device,
                queue: detached.queue,
                priority: detached.priority,
                origin,
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Stable identifier of the underlying queue
    pub fn id(&self) -> u64 {
        self.inner.queue.0
    }

    pub fn raw_queue(&self) -> QueueId {
        self.inner.queue
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn device_index(&self) -> usize {
        self.inner.device.index()
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn is_external(&self) -> bool {
        matches!(self.inner.origin, Origin::External)
    }

    pub fn is_default(&self) -> bool {
        matches!(&self.inner.origin, Origin::Pooled(slot) if slot.class() == PriorityClass::Default)
    }

    /// `true` if all work enqueued before this call has completed. Never blocks.
    pub fn query(&self) -> Result<bool> {
        self.inner.runtime.backend().query_queue(self.inner.queue)
    }

    /// Block the calling thread until all work enqueued so far has completed
    pub fn synchronize(&self) -> Result<()> {
        self.inner.runtime.backend().synchronize_queue(self.inner.queue)
    }

    /// Record `event` (or a fresh default event) at the current end of this stream
    pub fn record_event(&self, event: Option<Event>) -> Result<Event> {
        let event = match event {
            Some(event) => event,
            None => Event::new(&self.inner.runtime, Default::default())?,
        };
        event.record(self)?;
        Ok(event)
    }

    /// Later work on this stream waits for `event`'s latest record.
    /// A never-recorded event is already satisfied.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        event.wait(self)
    }

    /// Everything enqueued on `other` so far happens before anything enqueued
    /// on this stream after the call
    pub fn wait_stream(&self, other: &Stream) -> Result<()> {
        if self == other {
            return Ok(());
        }
        let marker = other.record_event(None)?;
        trace!(waiter = self.id(), producer = other.id(), "Stream barrier");
        self.wait_event(&marker)
    }

    /// Run `f` on the host once all previously enqueued work has completed
    pub fn launch_host_fn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let f: HostFn = Box::new(f);
        self.inner.runtime.backend().enqueue_host_fn(self.inner.queue, f)
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.runtime.same(&other.inner.runtime)
            && self.inner.device == other.inner.device
            && self.inner.queue == other.inner.queue
    }
}

impl Eq for Stream {}

impl Hash for Stream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.runtime.id().hash(state);
        self.inner.device.hash(state);
        self.inner.queue.hash(state);
    }
}

impl Ord for Stream {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .runtime
            .id()
            .cmp(&other.inner.runtime.id())
            .then_with(|| self.inner.device.cmp(&other.inner.device))
            .then_with(|| self.inner.queue.cmp(&other.inner.queue))
    }
}

impl PartialOrd for Stream {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.inner.device)
            .field("id", &self.inner.queue.0)
            .field("priority", &self.inner.priority)
            .field("external", &self.is_external())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceBackend;
    use crate::config::RuntimeConfig;
    use crate::sim::SimBackend;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    fn runtime() -> (Runtime, Arc<SimBackend>) {
        let backend = Arc::new(SimBackend::with_devices(2).unwrap());
        let config = RuntimeConfig {
            streams_per_priority: 2,
            ..RuntimeConfig::default()
        };
        (Runtime::new(backend.clone(), config).unwrap(), backend)
    }

    #[test]
    fn test_query_and_synchronize() {
        let (rt, _) = runtime();
        let stream = rt.stream(None, 0).unwrap();
        assert!(stream.query().unwrap());

        let gate = Arc::new(AtomicBool::new(false));
        let open = Arc::clone(&gate);
        stream
            .launch_host_fn(move || {
                while !open.load(AtomicOrdering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert!(!stream.query().unwrap());
        gate.store(true, AtomicOrdering::SeqCst);
        stream.synchronize().unwrap();
        assert!(stream.query().unwrap());
    }

    #[test]
    fn test_identity_is_stable() {
        let (rt, _) = runtime();
        let stream = rt.stream(Some(rt.device(1)), 0).unwrap();
        let copy = stream.clone();
        assert_eq!(stream.id(), copy.id());
        assert_eq!(stream.device_index(), 1);
        assert_eq!(stream, copy);

        let set: BTreeSet<Stream> = [stream.clone(), copy].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_external_stream_outlives_wrapper() {
        let (rt, backend) = runtime();
        let raw = backend.create_queue(0, 0).unwrap();
        let wrapped = Stream::from_external(&rt, raw, rt.device(0)).unwrap();
        assert!(wrapped.is_external());
        drop(wrapped);
        assert!(backend.query_queue(raw).unwrap());
        assert_eq!(rt.outstanding_streams(rt.device(0)).unwrap(), 0);
    }

    #[test]
    fn test_wait_stream_on_itself_is_noop() {
        let (rt, _) = runtime();
        let stream = rt.stream(None, 0).unwrap();
        stream.wait_stream(&stream).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn test_default_stream_flag() {
        let (rt, _) = runtime();
        assert!(rt.default_stream(rt.device(0)).unwrap().is_default());
        assert!(!rt.stream(None, 0).unwrap().is_default());
    }

    #[test]
    fn test_streams_of_different_runtimes_are_distinct() {
        let (a, _) = runtime();
        let (b, _) = runtime();
        let sa = a.default_stream(a.device(0)).unwrap();
        let sb = b.default_stream(b.device(0)).unwrap();
        assert_ne!(sa, sb);
        assert_ne!(sa.cmp(&sb), Ordering::Equal);

        let ordered: BTreeSet<Stream> = [sa.clone(), sb.clone(), sa.clone()].into_iter().collect();
        assert_eq!(ordered.len(), 2);
        let hashed: HashSet<Stream> = [sa.clone(), sb, sa].into_iter().collect();
        assert_eq!(hashed.len(), 2);
    }
}
