//! Per-device stream pools
//!
//! Each device owns one default queue plus `streams_per_priority` queues for
//! each priority class. Queues are created once, on first use of the device,
//! and handed out round-robin afterwards, so steady-state acquisition never
//! allocates. A slot counts the handles currently leasing it; the lease ends
//! when the last clone of a [`crate::Stream`] is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{DeviceBackend, QueueId};
use crate::error::Result;

/// Priority class a stream was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityClass {
    Default,
    Low,
    High,
}

#[derive(Debug)]
pub(crate) struct PoolSlot {
    queue: QueueId,
    class: PriorityClass,
    leases: AtomicUsize,
}

impl PoolSlot {
    fn new(queue: QueueId, class: PriorityClass) -> Self {
        Self {
            queue,
            class,
            leases: AtomicUsize::new(0),
        }
    }

    pub(crate) fn queue(&self) -> QueueId {
        self.queue
    }

    pub(crate) fn class(&self) -> PriorityClass {
        self.class
    }

    pub(crate) fn lease(self: &Arc<Self>) -> Arc<Self> {
        self.leases.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    pub(crate) fn release(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct DevicePool {
    device: usize,
    default: Arc<PoolSlot>,
    low: Vec<Arc<PoolSlot>>,
    high: Vec<Arc<PoolSlot>>,
    next_low: AtomicUsize,
    next_high: AtomicUsize,
}

impl DevicePool {
    pub(crate) fn create(
        backend: &dyn DeviceBackend,
        device: usize,
        per_priority: usize,
    ) -> Result<Self> {
        let (least, greatest) = backend.priority_range();
        let mut created: Vec<QueueId> = Vec::with_capacity(2 * per_priority + 1);
        let mut slot = |priority: i32, class: PriorityClass| -> Result<Arc<PoolSlot>> {
            let queue = backend.create_queue(device, priority)?;
            created.push(queue);
            Ok(Arc::new(PoolSlot::new(queue, class)))
        };
        let mut build = || -> Result<_> {
            let default = slot(least, PriorityClass::Default)?;
            let mut low = Vec::with_capacity(per_priority);
            let mut high = Vec::with_capacity(per_priority);
            for _ in 0..per_priority {
                low.push(slot(least, PriorityClass::Low)?);
                high.push(slot(greatest, PriorityClass::High)?);
            }
            Ok((default, low, high))
        };
        let (default, low, high) = match build() {
            Ok(slots) => slots,
            Err(e) => {
                warn!(device, created = created.len(), error = %e, "Stream pool creation failed");
                for queue in created {
                    backend.destroy_queue(queue);
                }
                return Err(e);
            }
        };
        debug!(device, per_priority, "Initialized stream pool");
        Ok(Self {
            device,
            default,
            low,
            high,
            next_low: AtomicUsize::new(0),
            next_high: AtomicUsize::new(0),
        })
    }

    pub(crate) fn default_slot(&self) -> &Arc<PoolSlot> {
        &self.default
    }

    pub(crate) fn next(&self, class: PriorityClass) -> &Arc<PoolSlot> {
        match class {
            PriorityClass::Default => &self.default,
            PriorityClass::Low => {
                let i = self.next_low.fetch_add(1, Ordering::Relaxed);
                &self.low[i % self.low.len()]
            }
            PriorityClass::High => {
                let i = self.next_high.fetch_add(1, Ordering::Relaxed);
                &self.high[i % self.high.len()]
            }
        }
    }

    pub(crate) fn queues(&self) -> impl Iterator<Item = QueueId> + '_ {
        std::iter::once(&self.default)
            .chain(self.low.iter())
            .chain(self.high.iter())
            .map(|slot| slot.queue)
    }

    /// Handles currently leasing any queue in this pool
    pub(crate) fn outstanding(&self) -> usize {
        std::iter::once(&self.default)
            .chain(self.low.iter())
            .chain(self.high.iter())
            .map(|slot| slot.leases())
            .sum()
    }

    pub(crate) fn destroy(&self, backend: &dyn DeviceBackend) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            warn!(device = self.device, outstanding, "Destroying stream pool with leased streams");
        }
        for queue in self.queues() {
            backend.destroy_queue(queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::error::ErrorKind;
    use crate::sim::SimBackend;

    #[test]
    fn test_round_robin_wraps() {
        let sim = SimBackend::with_devices(1).unwrap();
        let pool = DevicePool::create(&sim, 0, 3).unwrap();
        let first: Vec<QueueId> = (0..3).map(|_| pool.next(PriorityClass::Low).queue()).collect();
        let second: Vec<QueueId> = (0..3).map(|_| pool.next(PriorityClass::Low).queue()).collect();
        assert_eq!(first, second);
        assert_ne!(first[0], first[1]);
        assert_ne!(pool.next(PriorityClass::High).queue(), first[0]);
        assert_eq!(pool.queues().count(), 7);
    }

    #[test]
    fn test_leases_are_counted() {
        let sim = SimBackend::with_devices(1).unwrap();
        let pool = DevicePool::create(&sim, 0, 2).unwrap();
        let a = pool.next(PriorityClass::Low).lease();
        let b = pool.default_slot().lease();
        assert_eq!(pool.outstanding(), 2);
        a.release();
        b.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_partial_pool_released_on_failure() {
        let sim = SimBackend::new(SimConfig {
            max_queues_per_device: Some(3),
            ..SimConfig::with_devices(1)
        })
        .unwrap();
        let err = DevicePool::create(&sim, 0, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Hardware);
        assert_eq!(sim.live_queues(), 0);

        // The queues freed above are usable again
        let pool = DevicePool::create(&sim, 0, 1).unwrap();
        assert_eq!(pool.queues().count(), 3);
    }
}
