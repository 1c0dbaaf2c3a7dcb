//! Runtime: backend, stream pools and per-thread execution context
//!
//! The "current device" and the "current stream" of each device are
//! per-thread state. They live in a thread-local map keyed by runtime id, so
//! two runtimes used from the same thread never see each other's state.
//! Entries hold neither the runtime nor a stream lease; entries of dropped
//! runtimes are pruned the next time the thread creates an entry. Only
//! [`crate::DeviceGuard`], [`crate::StreamGuard`] and
//! [`Runtime::set_current_stream`] mutate it.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::backend::DeviceBackend;
use crate::config::{RuntimeConfig, SimConfig};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::pool::{DevicePool, PriorityClass};
use crate::sim::SimBackend;
use crate::stream::{DetachedStream, Stream};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadContext {
    owner: Weak<RuntimeShared>,
    device: usize,
    streams: HashMap<usize, DetachedStream>,
}

thread_local! {
    static CONTEXTS: RefCell<HashMap<u64, ThreadContext>> = RefCell::new(HashMap::new());
}

struct RuntimeShared {
    id: u64,
    config: RuntimeConfig,
    backend: Arc<dyn DeviceBackend>,
    pools: Vec<Mutex<Option<Arc<DevicePool>>>>,
}

impl Drop for RuntimeShared {
    fn drop(&mut self) {
        for pool in &self.pools {
            if let Some(pool) = pool.lock().take() {
                pool.destroy(self.backend.as_ref());
            }
        }
    }
}

/// Handle to a device backend plus its stream pools. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: RuntimeConfig) -> Result<Self> {
        let device_count = backend.device_count();
        config.validate(device_count)?;
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            runtime = id,
            backend = backend.name(),
            devices = device_count,
            "Runtime created"
        );
        Ok(Self {
            shared: Arc::new(RuntimeShared {
                id,
                config,
                backend,
                pools: (0..device_count).map(|_| Mutex::new(None)).collect(),
            }),
        })
    }

    /// Runtime over a fresh [`SimBackend`], configured from the environment
    pub fn from_env() -> Result<Self> {
        let backend = SimBackend::new(SimConfig::from_env()?)?;
        Self::new(Arc::new(backend), RuntimeConfig::from_env()?)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.shared.backend
    }

    pub fn device_count(&self) -> usize {
        self.shared.backend.device_count()
    }

    pub fn device(&self, index: usize) -> Device {
        Device::new(self.shared.backend.device_kind(), index)
    }

    pub fn devices(&self) -> Vec<Device> {
        (0..self.device_count()).map(|i| self.device(i)).collect()
    }

    pub fn same(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn check_device(&self, op: &'static str, device: Device) -> Result<()> {
        let kind = self.shared.backend.device_kind();
        if device.kind() != kind {
            return Err(Error::invalid_device(
                op,
                device,
                format!("runtime drives {} devices", kind.as_str()),
            ));
        }
        if device.index() >= self.device_count() {
            return Err(Error::invalid_device(
                op,
                device,
                format!("runtime has {} devices", self.device_count()),
            ));
        }
        Ok(())
    }

    fn pool(&self, device: usize) -> Result<Arc<DevicePool>> {
        let mut slot = self.shared.pools[device].lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(DevicePool::create(
            self.shared.backend.as_ref(),
            device,
            self.shared.config.streams_per_priority,
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Stream handles currently alive on `device`
    pub fn outstanding_streams(&self, device: Device) -> Result<usize> {
        self.check_device("outstanding_streams", device)?;
        Ok(self.shared.pools[device.index()]
            .lock()
            .as_ref()
            .map(|pool| pool.outstanding())
            .unwrap_or(0))
    }

    fn with_context<T>(&self, f: impl FnOnce(&mut ThreadContext) -> T) -> T {
        let default_device = self.shared.config.default_device;
        CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            if !contexts.contains_key(&self.shared.id) {
                contexts.retain(|_, ctx| ctx.owner.strong_count() > 0);
            }
            let context = contexts.entry(self.shared.id).or_insert_with(|| ThreadContext {
                owner: Arc::downgrade(&self.shared),
                device: default_device,
                streams: HashMap::new(),
            });
            f(context)
        })
    }

    /// Device the calling thread is currently on
    pub fn current_device(&self) -> Device {
        self.device(self.with_context(|ctx| ctx.device))
    }

    /// Switch the calling thread's current device, returning the previous one
    pub(crate) fn exchange_device(&self, op: &'static str, device: Device) -> Result<Device> {
        self.check_device(op, device)?;
        let prior = self.with_context(|ctx| std::mem::replace(&mut ctx.device, device.index()));
        Ok(self.device(prior))
    }

    /// Acquire a stream from `device`'s pool (current device when `None`)
    ///
    /// Negative priorities draw from the high-priority class. The priority is
    /// a scheduling hint for the backend, not a guarantee.
    pub fn stream(&self, device: Option<Device>, priority: i32) -> Result<Stream> {
        let device = device.unwrap_or_else(|| self.current_device());
        self.check_device("Stream::new", device)?;
        let (least, greatest) = self.shared.backend.priority_range();
        let priority = priority.clamp(greatest.min(least), least.max(greatest));
        let class = if priority < least {
            PriorityClass::High
        } else {
            PriorityClass::Low
        };
        let pool = self.pool(device.index())?;
        let slot = pool.next(class).lease();
        debug!(device = %device, queue = slot.queue().0, priority, "Acquired pooled stream");
        Ok(Stream::pooled(self.clone(), device, slot, priority))
    }

    /// The default stream of `device`
    pub fn default_stream(&self, device: Device) -> Result<Stream> {
        self.check_device("default_stream", device)?;
        let pool = self.pool(device.index())?;
        let slot = pool.default_slot().lease();
        let (least, _) = self.shared.backend.priority_range();
        Ok(Stream::pooled(self.clone(), device, slot, least))
    }

    /// The calling thread's current stream on `device` (current device when `None`)
    pub fn current_stream(&self, device: Option<Device>) -> Result<Stream> {
        let device = device.unwrap_or_else(|| self.current_device());
        self.check_device("current_stream", device)?;
        if let Some(detached) = self.with_context(|ctx| ctx.streams.get(&device.index()).cloned()) {
            return Ok(Stream::attach(self, &detached));
        }
        self.default_stream(device)
    }

    /// Make `stream` the calling thread's current stream on its device
    pub fn set_current_stream(&self, stream: &Stream) -> Result<()> {
        self.replace_current_stream(stream.device(), Some(stream))
            .map(|_| ())
    }

    /// Set (or with `None`, clear back to the default stream) the calling
    /// thread's current stream on `device`. Returns the stream that was
    /// explicitly set before, if any.
    pub(crate) fn replace_current_stream(
        &self,
        device: Device,
        stream: Option<&Stream>,
    ) -> Result<Option<Stream>> {
        let op = "set_current_stream";
        self.check_device(op, device)?;
        if let Some(stream) = stream {
            if !self.same(stream.runtime()) {
                return Err(Error::invalid_config(op, "stream belongs to a different runtime"));
            }
            if stream.device() != device {
                return Err(Error::invalid_device(
                    op,
                    stream.device(),
                    format!("stream set as current for {}", device),
                ));
            }
        }
        let prior = self.with_context(|ctx| match stream {
            Some(stream) => ctx.streams.insert(device.index(), stream.detach()),
            None => ctx.streams.remove(&device.index()),
        });
        Ok(prior.map(|detached| Stream::attach(self, &detached)))
    }

    /// Block until every pooled queue of `device` has drained
    pub fn synchronize_device(&self, device: Device) -> Result<()> {
        self.check_device("synchronize_device", device)?;
        let pool = self.pool(device.index())?;
        for queue in pool.queues() {
            self.shared.backend.synchronize_queue(queue)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.shared.id)
            .field("backend", &self.shared.backend.name())
            .field("devices", &self.device_count())
            .finish()
    }
}
