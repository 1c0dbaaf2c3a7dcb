//! Simulated multi-device backend
//!
//! Each queue is an in-order command list drained by its own worker thread,
//! so work on different streams really does run concurrently with each other
//! and with the host. Events are generation-counted: a wait captures the
//! generation that was latest when it was enqueued, so re-recording an event
//! never retargets waits that are already in flight.
//!
//! Device memory is a shared host byte vector. Queued commands hold their own
//! reference to it, which keeps freed allocations alive until the work that
//! touches them has drained.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::backend::{
    AllocationId, CopyRun, DeviceBackend, EventFlags, EventId, HostFn, IpcEventHandle, QueueId,
    IPC_HANDLE_SIZE,
};
use crate::config::SimConfig;
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};

const HANDLE_MAGIC: u32 = 0x5853_4556;

type Memory = Arc<Mutex<Vec<u8>>>;

/// Fault injected into one simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every operation touching the device fails
    Unreachable,
    /// Allocation works, copies into or out of the device fail
    CopyEngine,
}

enum Command {
    Copy {
        src: Memory,
        dst: Memory,
        runs: Vec<CopyRun>,
    },
    Write {
        dst: Memory,
        offset: usize,
        data: Vec<u8>,
    },
    Record {
        event: Arc<SimEvent>,
        generation: u64,
    },
    Wait {
        event: Arc<SimEvent>,
        generation: u64,
    },
    Host(HostFn),
}

impl Command {
    fn execute(self) {
        match self {
            Command::Copy { src, dst, runs } => {
                // Stage through host memory so two queues copying in opposite
                // directions never hold both locks at once.
                let staged: Vec<Vec<u8>> = {
                    let src = src.lock();
                    runs.iter()
                        .map(|run| src[run.src_offset..run.src_offset + run.len].to_vec())
                        .collect()
                };
                let mut dst = dst.lock();
                for (run, bytes) in runs.iter().zip(staged) {
                    dst[run.dst_offset..run.dst_offset + run.len].copy_from_slice(&bytes);
                }
            }
            Command::Write { dst, offset, data } => {
                let mut dst = dst.lock();
                dst[offset..offset + data.len()].copy_from_slice(&data);
            }
            Command::Record { event, generation } => event.complete(generation),
            Command::Wait { event, generation } => event.wait_parked(generation),
            Command::Host(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    warn!("host callback panicked on simulated queue");
                }
            }
        }
    }
}

struct QueueState {
    pending: VecDeque<Command>,
    submitted: u64,
    completed: u64,
    shutdown: bool,
    worker_started: bool,
}

struct SimQueue {
    id: QueueId,
    device: usize,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl SimQueue {
    fn new(id: QueueId, device: usize) -> Self {
        Self {
            id,
            device,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                submitted: 0,
                completed: 0,
                shutdown: false,
                worker_started: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Queue a command, spawning the worker on first use
    fn push(self: &Arc<Self>, command: Command) -> std::io::Result<Option<JoinHandle<()>>> {
        let mut state = self.state.lock();
        let worker = if state.worker_started {
            None
        } else {
            let queue = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("xstream-sim{}-q{}", self.device, self.id.0))
                .spawn(move || queue.run())?;
            state.worker_started = true;
            Some(handle)
        };
        state.pending.push_back(command);
        state.submitted += 1;
        self.cond.notify_all();
        Ok(worker)
    }

    fn run(&self) {
        loop {
            let command = {
                let mut state = self.state.lock();
                loop {
                    if let Some(command) = state.pending.pop_front() {
                        break command;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.cond.wait(&mut state);
                }
            };
            command.execute();
            let mut state = self.state.lock();
            state.completed += 1;
            self.cond.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.completed >= state.submitted
    }

    fn synchronize(&self) {
        let mut state = self.state.lock();
        let target = state.submitted;
        while state.completed < target {
            self.cond.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }
}

struct EventState {
    recorded: u64,
    pending: BTreeSet<u64>,
    completed_at: Option<Instant>,
}

struct SimEvent {
    device: usize,
    flags: EventFlags,
    spin: bool,
    state: Mutex<EventState>,
    cond: Condvar,
}

impl SimEvent {
    fn begin_record(&self) -> u64 {
        let mut state = self.state.lock();
        state.recorded += 1;
        let generation = state.recorded;
        state.pending.insert(generation);
        state.completed_at = None;
        generation
    }

    fn complete(&self, generation: u64) {
        let mut state = self.state.lock();
        state.pending.remove(&generation);
        if generation == state.recorded {
            state.completed_at = Some(Instant::now());
        }
        self.cond.notify_all();
    }

    fn latest(&self) -> u64 {
        self.state.lock().recorded
    }

    fn reached(&self, generation: u64) -> bool {
        !self.state.lock().pending.contains(&generation)
    }

    fn wait_parked(&self, generation: u64) {
        let mut state = self.state.lock();
        while state.pending.contains(&generation) {
            self.cond.wait(&mut state);
        }
    }

    fn wait_host(&self, generation: u64) {
        if self.spin {
            while !self.reached(generation) {
                std::thread::yield_now();
            }
        } else {
            self.wait_parked(generation);
        }
    }
}

struct SimAllocation {
    device: usize,
    nbytes: usize,
    memory: Memory,
}

#[derive(Serialize, Deserialize)]
struct HandlePayload {
    magic: u32,
    backend: Uuid,
    event: u64,
    device: u32,
}

/// In-process backend simulating `device_count` accelerators
pub struct SimBackend {
    id: Uuid,
    config: SimConfig,
    next_handle: AtomicU64,
    queues: DashMap<QueueId, Arc<SimQueue>>,
    events: DashMap<EventId, Arc<SimEvent>>,
    allocations: DashMap<AllocationId, SimAllocation>,
    faults: Mutex<HashMap<usize, Fault>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    copies_issued: AtomicU64,
}

impl SimBackend {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        debug!(devices = config.device_count, "Creating simulated backend");
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            next_handle: AtomicU64::new(1),
            queues: DashMap::new(),
            events: DashMap::new(),
            allocations: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            copies_issued: AtomicU64::new(0),
        })
    }

    pub fn with_devices(device_count: usize) -> Result<Self> {
        Self::new(SimConfig::with_devices(device_count))
    }

    /// Inject (or clear with `None`) a fault on `device`
    pub fn set_fault(&self, device: usize, fault: Option<Fault>) {
        let mut faults = self.faults.lock();
        match fault {
            Some(fault) => {
                faults.insert(device, fault);
            }
            None => {
                faults.remove(&device);
            }
        }
    }

    /// Number of device copies accepted so far
    pub fn copies_issued(&self) -> u64 {
        self.copies_issued.load(Ordering::SeqCst)
    }

    /// Number of queues not yet destroyed
    pub fn live_queues(&self) -> usize {
        self.queues.len()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn device(index: usize) -> Device {
        Device::sim(index)
    }

    fn check_device(&self, op: &'static str, device: usize, copying: bool) -> Result<()> {
        if device >= self.config.device_count {
            return Err(Error::invalid_device(
                op,
                Self::device(device),
                format!("backend has {} devices", self.config.device_count),
            ));
        }
        match self.faults.lock().get(&device) {
            Some(Fault::Unreachable) => Err(Error::hardware(
                op,
                Self::device(device),
                "device unreachable",
            )),
            Some(Fault::CopyEngine) if copying => Err(Error::hardware(
                op,
                Self::device(device),
                "copy engine unavailable",
            )),
            _ => Ok(()),
        }
    }

    fn queue(&self, op: &'static str, queue: QueueId) -> Result<Arc<SimQueue>> {
        self.queues
            .get(&queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| Error::invalid_config(op, format!("unknown queue {:?}", queue)))
    }

    fn event(&self, op: &'static str, event: EventId) -> Result<Arc<SimEvent>> {
        self.events
            .get(&event)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::invalid_config(op, format!("unknown event {:?}", event)))
    }

    fn memory(&self, op: &'static str, allocation: AllocationId) -> Result<(usize, usize, Memory)> {
        self.allocations
            .get(&allocation)
            .map(|a| (a.device, a.nbytes, Arc::clone(&a.memory)))
            .ok_or_else(|| Error::invalid_config(op, format!("unknown allocation {:?}", allocation)))
    }

    fn submit(&self, op: &'static str, queue: &Arc<SimQueue>, command: Command) -> Result<()> {
        match queue.push(command) {
            Ok(Some(worker)) => {
                self.workers.lock().push(worker);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(Error::hardware(
                op,
                Self::device(queue.device),
                format!("failed to start queue worker: {}", e),
            )),
        }
    }
}

impl std::fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimBackend")
            .field("id", &self.id)
            .field("devices", &self.config.device_count)
            .field("queues", &self.queues.len())
            .field("events", &self.events.len())
            .field("allocations", &self.allocations.len())
            .finish()
    }
}

impl DeviceBackend for SimBackend {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Sim
    }

    fn device_count(&self) -> usize {
        self.config.device_count
    }

    fn priority_range(&self) -> (i32, i32) {
        (0, -1)
    }

    fn create_queue(&self, device: usize, priority: i32) -> Result<QueueId> {
        self.check_device("create_queue", device, false)?;
        if let Some(limit) = self.config.max_queues_per_device {
            let live = self.queues.iter().filter(|q| q.device == device).count();
            if live >= limit {
                return Err(Error::hardware(
                    "create_queue",
                    Self::device(device),
                    format!("all {} hardware queues in use", limit),
                ));
            }
        }
        let id = QueueId(self.next_id());
        self.queues.insert(id, Arc::new(SimQueue::new(id, device)));
        trace!(queue = id.0, device, priority, "Created simulated queue");
        Ok(id)
    }

    fn destroy_queue(&self, queue: QueueId) {
        if let Some((_, queue)) = self.queues.remove(&queue) {
            queue.shutdown();
        }
    }

    fn query_queue(&self, queue: QueueId) -> Result<bool> {
        Ok(self.queue("query_queue", queue)?.is_idle())
    }

    fn synchronize_queue(&self, queue: QueueId) -> Result<()> {
        let queue = self.queue("synchronize_queue", queue)?;
        self.check_device("synchronize_queue", queue.device, false)?;
        queue.synchronize();
        Ok(())
    }

    fn allocate(&self, device: usize, nbytes: usize) -> Result<AllocationId> {
        self.check_device("allocate", device, false)?;
        let id = AllocationId(self.next_id());
        self.allocations.insert(
            id,
            SimAllocation {
                device,
                nbytes,
                memory: Arc::new(Mutex::new(vec![0u8; nbytes])),
            },
        );
        Ok(id)
    }

    fn free(&self, allocation: AllocationId) {
        self.allocations.remove(&allocation);
    }

    fn enqueue_copy(
        &self,
        queue: QueueId,
        src: AllocationId,
        dst: AllocationId,
        runs: &[CopyRun],
    ) -> Result<()> {
        let op = "enqueue_copy";
        let queue = self.queue(op, queue)?;
        let (src_device, src_len, src_memory) = self.memory(op, src)?;
        let (dst_device, dst_len, dst_memory) = self.memory(op, dst)?;
        self.check_device(op, src_device, true)?;
        self.check_device(op, dst_device, true)?;
        self.check_device(op, queue.device, false)?;

        for run in runs {
            if run.src_offset + run.len > src_len || run.dst_offset + run.len > dst_len {
                return Err(Error::invalid_config(
                    op,
                    format!("copy run {:?} exceeds allocation bounds", run),
                ));
            }
        }

        self.copies_issued.fetch_add(1, Ordering::SeqCst);
        trace!(queue = queue.id.0, src_device, dst_device, runs = runs.len(), "Enqueued copy");
        self.submit(
            op,
            &queue,
            Command::Copy {
                src: src_memory,
                dst: dst_memory,
                runs: runs.to_vec(),
            },
        )
    }

    fn enqueue_write(
        &self,
        queue: QueueId,
        dst: AllocationId,
        offset: usize,
        data: Vec<u8>,
    ) -> Result<()> {
        let op = "enqueue_write";
        let queue = self.queue(op, queue)?;
        let (device, len, memory) = self.memory(op, dst)?;
        self.check_device(op, device, true)?;
        if offset + data.len() > len {
            return Err(Error::invalid_config(
                op,
                format!("write of {} bytes at {} exceeds {} bytes", data.len(), offset, len),
            ));
        }
        self.submit(
            op,
            &queue,
            Command::Write {
                dst: memory,
                offset,
                data,
            },
        )
    }

    fn read(&self, allocation: AllocationId, offset: usize, len: usize) -> Result<Vec<u8>> {
        let op = "read";
        let (device, nbytes, memory) = self.memory(op, allocation)?;
        self.check_device(op, device, true)?;
        if offset + len > nbytes {
            return Err(Error::invalid_config(
                op,
                format!("read of {} bytes at {} exceeds {} bytes", len, offset, nbytes),
            ));
        }
        let memory = memory.lock();
        Ok(memory[offset..offset + len].to_vec())
    }

    fn enqueue_host_fn(&self, queue: QueueId, f: HostFn) -> Result<()> {
        let queue = self.queue("enqueue_host_fn", queue)?;
        self.submit("enqueue_host_fn", &queue, Command::Host(f))
    }

    fn create_event(&self, device: usize, flags: EventFlags) -> Result<EventId> {
        flags.validate()?;
        self.check_device("create_event", device, false)?;
        let id = EventId(self.next_id());
        self.events.insert(
            id,
            Arc::new(SimEvent {
                device,
                flags,
                spin: self.config.blocking_spin && !flags.blocking_sync,
                state: Mutex::new(EventState {
                    recorded: 0,
                    pending: BTreeSet::new(),
                    completed_at: None,
                }),
                cond: Condvar::new(),
            }),
        );
        Ok(id)
    }

    fn destroy_event(&self, event: EventId) {
        self.events.remove(&event);
    }

    fn record_event(&self, event: EventId, queue: QueueId) -> Result<()> {
        let op = "record_event";
        let queue = self.queue(op, queue)?;
        let event = self.event(op, event)?;
        self.check_device(op, queue.device, false)?;
        let generation = event.begin_record();
        let result = self.submit(
            op,
            &queue,
            Command::Record {
                event: Arc::clone(&event),
                generation,
            },
        );
        if result.is_err() {
            // Nothing will ever complete this generation
            event.complete(generation);
        }
        result
    }

    fn query_event(&self, event: EventId) -> Result<bool> {
        let event = self.event("query_event", event)?;
        let latest = event.latest();
        Ok(latest == 0 || event.reached(latest))
    }

    fn synchronize_event(&self, event: EventId) -> Result<()> {
        let event = self.event("synchronize_event", event)?;
        let latest = event.latest();
        if latest > 0 {
            event.wait_host(latest);
        }
        Ok(())
    }

    fn queue_wait_event(&self, queue: QueueId, event: EventId) -> Result<()> {
        let op = "queue_wait_event";
        let queue = self.queue(op, queue)?;
        let event = self.event(op, event)?;
        self.check_device(op, queue.device, false)?;
        let generation = event.latest();
        if generation == 0 || event.reached(generation) {
            return Ok(());
        }
        self.submit(op, &queue, Command::Wait { event, generation })
    }

    fn elapsed_time(&self, start: EventId, end: EventId) -> Result<f64> {
        let op = "elapsed_time";
        let start = self.event(op, start)?;
        let end = self.event(op, end)?;
        if !start.flags.enable_timing || !end.flags.enable_timing {
            return Err(Error::TimingDisabled { op });
        }
        let begin = start.state.lock().completed_at;
        let finish = end.state.lock().completed_at;
        match (begin, finish) {
            (Some(begin), Some(finish)) => Ok(if finish >= begin {
                finish.duration_since(begin).as_secs_f64() * 1000.0
            } else {
                -(begin.duration_since(finish).as_secs_f64() * 1000.0)
            }),
            _ => Err(Error::NotReady { op }),
        }
    }

    fn export_event(&self, event: EventId) -> Result<IpcEventHandle> {
        let op = "export_event";
        let sim_event = self.event(op, event)?;
        if !sim_event.flags.interprocess {
            return Err(Error::not_shareable(op, "event created without interprocess flag"));
        }
        let payload = HandlePayload {
            magic: HANDLE_MAGIC,
            backend: self.id,
            event: event.0,
            device: sim_event.device as u32,
        };
        let encoded = bincode::serialize(&payload)
            .map_err(|e| Error::hardware(op, Self::device(sim_event.device), e.to_string()))?;
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        bytes[..encoded.len()].copy_from_slice(&encoded);
        Ok(IpcEventHandle::from_array(bytes))
    }

    fn import_event(&self, device: usize, handle: &IpcEventHandle) -> Result<EventId> {
        let op = "import_event";
        self.check_device(op, device, false)?;
        let payload: HandlePayload = bincode::deserialize(handle.as_bytes())
            .map_err(|e| Error::not_shareable(op, format!("malformed handle: {}", e)))?;
        if payload.magic != HANDLE_MAGIC {
            return Err(Error::not_shareable(op, "not an event handle"));
        }
        if payload.backend != self.id {
            return Err(Error::not_shareable(op, "handle was exported by another runtime"));
        }
        if payload.device as usize != device {
            return Err(Error::invalid_device(
                op,
                Self::device(device),
                format!("handle belongs to device {}", payload.device),
            ));
        }
        let shared = self.event(op, EventId(payload.event)).map_err(|_| {
            Error::hardware(op, Self::device(device), "exported event has been released")
        })?;
        let id = EventId(self.next_id());
        self.events.insert(id, shared);
        Ok(id)
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        for queue in self.queues.iter() {
            queue.value().shutdown();
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                warn!("simulated queue worker panicked");
            }
        }
    }
}
