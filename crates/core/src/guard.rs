//! Scoped switches of the calling thread's current device and stream
//!
//! Both guards restore what was current when they were entered, exactly once,
//! on every exit path: explicit [`DeviceGuard::exit`], normal drop, early
//! return through `?`, or unwinding. Guards are tied to the thread that
//! created them and are therefore `!Send`.

use std::marker::PhantomData;
use tracing::trace;

use crate::device::Device;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::stream::Stream;

pub struct DeviceGuard {
    runtime: Runtime,
    prior: Device,
    current: Device,
    active: bool,
    _not_send: PhantomData<*const ()>,
}

impl DeviceGuard {
    /// Make `device` current. Fails with `InvalidDevice`, leaving the thread
    /// state untouched, if the runtime does not drive it.
    pub fn enter(runtime: &Runtime, device: Device) -> Result<Self> {
        let prior = runtime.exchange_device("DeviceGuard::enter", device)?;
        trace!(from = %prior, to = %device, "Entered device guard");
        Ok(Self {
            runtime: runtime.clone(),
            prior,
            current: device,
            active: true,
            _not_send: PhantomData,
        })
    }

    /// Retarget the guard; the device restored on exit stays the original one.
    /// After [`DeviceGuard::exit`] this re-arms the guard.
    pub fn set(&mut self, device: Device) -> Result<()> {
        self.runtime.exchange_device("DeviceGuard::set", device)?;
        self.current = device;
        self.active = true;
        Ok(())
    }

    pub fn prior_device(&self) -> Device {
        self.prior
    }

    pub fn current_device(&self) -> Device {
        self.current
    }

    /// Restore the prior device. Calling it again does nothing.
    pub fn exit(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        // prior was validated on the way in
        let _ = self.runtime.exchange_device("DeviceGuard::exit", self.prior);
        trace!(to = %self.prior, "Exited device guard");
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Scoped switch of the current stream, and of the current device to the
/// stream's device
pub struct StreamGuard {
    runtime: Runtime,
    device_guard: DeviceGuard,
    /// Streams explicitly current on each device this guard touched, `None`
    /// where the device was on its default stream
    prior_streams: Vec<(Device, Option<Stream>)>,
    current: Stream,
    active: bool,
}

impl StreamGuard {
    pub fn enter(stream: &Stream) -> Result<Self> {
        let runtime = stream.runtime().clone();
        let device_guard = DeviceGuard::enter(&runtime, stream.device())?;
        let prior = runtime.replace_current_stream(stream.device(), Some(stream))?;
        Ok(Self {
            runtime,
            device_guard,
            prior_streams: vec![(stream.device(), prior)],
            current: stream.clone(),
            active: true,
        })
    }

    /// Switch to another stream, possibly on another device, without
    /// releasing the guard
    pub fn reset(&mut self, stream: &Stream) -> Result<()> {
        self.device_guard.set(stream.device())?;
        let prior = self
            .runtime
            .replace_current_stream(stream.device(), Some(stream))?;
        if !self.prior_streams.iter().any(|(device, _)| *device == stream.device()) {
            self.prior_streams.push((stream.device(), prior));
        }
        self.current = stream.clone();
        self.active = true;
        Ok(())
    }

    pub fn current_stream(&self) -> &Stream {
        &self.current
    }

    pub fn exit(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        for (device, prior) in self.prior_streams.drain(..).rev() {
            let _ = self.runtime.replace_current_stream(device, prior.as_ref());
        }
        self.device_guard.exit();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::ErrorKind;
    use crate::sim::SimBackend;
    use std::sync::Arc;

    fn runtime() -> Runtime {
        let backend = Arc::new(SimBackend::with_devices(3).unwrap());
        let config = RuntimeConfig {
            streams_per_priority: 2,
            ..RuntimeConfig::default()
        };
        Runtime::new(backend, config).unwrap()
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let rt = runtime();
        {
            let guard = DeviceGuard::enter(&rt, rt.device(2)).unwrap();
            assert_eq!(rt.current_device(), rt.device(2));
            assert_eq!(guard.prior_device(), rt.device(0));
        }
        assert_eq!(rt.current_device(), rt.device(0));
    }

    #[test]
    fn test_set_keeps_prior() {
        let rt = runtime();
        let mut guard = DeviceGuard::enter(&rt, rt.device(1)).unwrap();
        guard.set(rt.device(2)).unwrap();
        guard.set(rt.device(1)).unwrap();
        assert_eq!(rt.current_device(), rt.device(1));
        assert_eq!(guard.prior_device(), rt.device(0));
        drop(guard);
        assert_eq!(rt.current_device(), rt.device(0));
    }

    #[test]
    fn test_exit_is_idempotent() {
        let rt = runtime();
        let mut outer = DeviceGuard::enter(&rt, rt.device(1)).unwrap();
        let mut inner = DeviceGuard::enter(&rt, rt.device(2)).unwrap();
        inner.exit();
        assert_eq!(rt.current_device(), rt.device(1));

        // A second restore would clobber the outer guard's device
        outer.set(rt.device(2)).unwrap();
        inner.exit();
        drop(inner);
        assert_eq!(rt.current_device(), rt.device(2));
        outer.exit();
        assert_eq!(rt.current_device(), rt.device(0));
    }

    #[test]
    fn test_invalid_device_leaves_state() {
        let rt = runtime();
        let err = DeviceGuard::enter(&rt, rt.device(7)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidDevice);
        assert_eq!(rt.current_device(), rt.device(0));

        let mut guard = DeviceGuard::enter(&rt, rt.device(1)).unwrap();
        assert!(guard.set(rt.device(9)).is_err());
        assert_eq!(rt.current_device(), rt.device(1));
    }

    #[test]
    fn test_guard_restores_on_error_path() {
        let rt = runtime();
        let run = |rt: &Runtime| -> Result<()> {
            let mut guard = DeviceGuard::enter(rt, rt.device(1))?;
            guard.set(rt.device(2))?;
            guard.set(rt.device(5))?;
            Ok(())
        };
        assert!(run(&rt).is_err());
        assert_eq!(rt.current_device(), rt.device(0));
    }

    #[test]
    fn test_stream_guard_restores_stream_and_device() {
        let rt = runtime();
        let original = rt.current_stream(Some(rt.device(1))).unwrap();
        let side = rt.stream(Some(rt.device(1)), 0).unwrap();
        {
            let _guard = StreamGuard::enter(&side).unwrap();
            assert_eq!(rt.current_device(), rt.device(1));
            assert_eq!(rt.current_stream(None).unwrap(), side);
        }
        assert_eq!(rt.current_device(), rt.device(0));
        assert_eq!(rt.current_stream(Some(rt.device(1))).unwrap(), original);
    }

    #[test]
    fn test_stream_guard_reset_across_devices() {
        let rt = runtime();
        let before0 = rt.current_stream(Some(rt.device(0))).unwrap();
        let before2 = rt.current_stream(Some(rt.device(2))).unwrap();
        let a = rt.stream(Some(rt.device(0)), 0).unwrap();
        let b = rt.stream(Some(rt.device(2)), 0).unwrap();
        {
            let mut guard = StreamGuard::enter(&a).unwrap();
            guard.reset(&b).unwrap();
            assert_eq!(rt.current_device(), rt.device(2));
            assert_eq!(guard.current_stream(), &b);
        }
        assert_eq!(rt.current_stream(Some(rt.device(0))).unwrap(), before0);
        assert_eq!(rt.current_stream(Some(rt.device(2))).unwrap(), before2);
        assert_eq!(rt.current_device(), rt.device(0));
    }

    #[test]
    fn test_stream_guard_leaves_no_lease_behind() {
        let backend = Arc::new(SimBackend::with_devices(2).unwrap());
        let rt = Runtime::new(backend.clone(), RuntimeConfig::default()).unwrap();
        let side = rt.stream(Some(rt.device(1)), 0).unwrap();
        {
            let mut guard = StreamGuard::enter(&side).unwrap();
            guard.reset(&rt.stream(Some(rt.device(0)), -1).unwrap()).unwrap();
        }
        drop(side);
        assert_eq!(rt.outstanding_streams(rt.device(0)).unwrap(), 0);
        assert_eq!(rt.outstanding_streams(rt.device(1)).unwrap(), 0);

        drop(rt);
        assert_eq!(Arc::strong_count(&backend), 1);
    }

    #[test]
    fn test_stream_guard_restores_explicit_stream() {
        let rt = runtime();
        let outer = rt.stream(Some(rt.device(0)), 0).unwrap();
        rt.set_current_stream(&outer).unwrap();
        {
            let _guard = StreamGuard::enter(&rt.stream(Some(rt.device(0)), -1).unwrap()).unwrap();
            assert_ne!(rt.current_stream(None).unwrap(), outer);
        }
        assert_eq!(rt.current_stream(None).unwrap(), outer);
    }
}
