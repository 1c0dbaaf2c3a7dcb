//! Scatter: split one buffer across devices
//!
//! Every check and every output allocation happens before the first copy is
//! enqueued, so a request that is invalid up front issues no device work.
//! Copies are then issued in destination order; a hardware failure part way
//! through is returned as-is and nothing is retried. Each copy names its
//! stream explicitly, so the calling thread's current streams are left as
//! they were and still identify the writer of unfenced sources.

use tracing::debug;
use xstream_core::{Buffer, Device, Error, Result, Stream};

use crate::plan::ChunkPlan;

#[derive(Debug, Clone)]
pub struct Scatter {
    devices: Vec<Device>,
    chunk_sizes: Option<Vec<usize>>,
    dim: usize,
    streams: Option<Vec<Option<Stream>>>,
    unsqueeze_scalars: bool,
}

impl Scatter {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            chunk_sizes: None,
            dim: 0,
            streams: None,
            unsqueeze_scalars: false,
        }
    }

    /// Explicit per-destination extents along the split dimension
    pub fn with_chunk_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.chunk_sizes = Some(sizes);
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// One entry per destination. `Some` must be on that destination's
    /// device; `None` uses the destination's current stream.
    pub fn with_streams(mut self, streams: Vec<Option<Stream>>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Scatter 0-dimensional inputs as a length-1 copy per device
    pub fn with_unsqueeze_scalars(mut self, unsqueeze: bool) -> Self {
        self.unsqueeze_scalars = unsqueeze;
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Copy each chunk of `source` to its device. The outputs come back in
    /// device order, each fenced by the stream that wrote it.
    pub fn apply(&self, source: &Buffer) -> Result<Vec<Buffer>> {
        let op = "Scatter::apply";
        let runtime = source.runtime();
        if self.devices.is_empty() {
            return Err(Error::invalid_config(op, "no destination devices"));
        }
        for &device in &self.devices {
            runtime.check_device(op, device)?;
        }

        let streams = match &self.streams {
            Some(streams) => {
                if streams.len() != self.devices.len() {
                    return Err(Error::invalid_config(
                        op,
                        format!(
                            "{} streams for {} devices",
                            streams.len(),
                            self.devices.len()
                        ),
                    ));
                }
                streams
                    .iter()
                    .zip(&self.devices)
                    .map(|(stream, &device)| match stream {
                        Some(stream) => {
                            if !runtime.same(stream.runtime()) {
                                return Err(Error::invalid_config(
                                    op,
                                    "stream belongs to a different runtime",
                                ));
                            }
                            if stream.device() != device {
                                return Err(Error::invalid_device(
                                    op,
                                    stream.device(),
                                    format!("stream given for destination {}", device),
                                ));
                            }
                            Ok(stream.clone())
                        }
                        None => runtime.current_stream(Some(device)),
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => self
                .devices
                .iter()
                .map(|&device| runtime.current_stream(Some(device)))
                .collect::<Result<Vec<_>>>()?,
        };

        let scalar = source.ndim() == 0;
        if scalar && !self.unsqueeze_scalars {
            return Err(Error::shape_mismatch(op, "cannot split a 0-dimensional buffer"));
        }
        let source = if scalar {
            source.unsqueeze(0)?
        } else {
            source.clone()
        };
        if self.dim >= source.ndim() {
            return Err(Error::shape_mismatch(
                op,
                format!("dim {} out of range for {} dimensions", self.dim, source.ndim()),
            ));
        }

        // A scalar is replicated, not split
        let views: Vec<Buffer> = if scalar {
            vec![source.clone(); self.devices.len()]
        } else {
            let extent = source.shape()[self.dim];
            let plan = match &self.chunk_sizes {
                Some(sizes) => {
                    if sizes.len() != self.devices.len() {
                        return Err(Error::shape_mismatch(
                            op,
                            format!(
                                "{} chunk sizes for {} devices",
                                sizes.len(),
                                self.devices.len()
                            ),
                        ));
                    }
                    ChunkPlan::explicit(self.dim, extent, sizes)?
                }
                None => ChunkPlan::even(self.dim, extent, self.devices.len())?,
            };
            debug!(devices = self.devices.len(), plan = %plan.summary(), "Scatter plan");
            plan.chunks
                .iter()
                .map(|chunk| source.narrow(self.dim, chunk.offset, chunk.extent))
                .collect::<Result<Vec<_>>>()?
        };

        let outputs = views
            .iter()
            .zip(&self.devices)
            .map(|(view, &device)| Buffer::empty(runtime, device, view.shape(), view.elem_size()))
            .collect::<Result<Vec<_>>>()?;

        for ((output, view), stream) in outputs.iter().zip(&views).zip(&streams) {
            output.copy_from(view, stream)?;
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use xstream_core::{ErrorKind, Runtime, RuntimeConfig, SimBackend};

    fn runtime(devices: usize) -> (Runtime, Arc<SimBackend>) {
        let backend = Arc::new(SimBackend::with_devices(devices).unwrap());
        let config = RuntimeConfig {
            streams_per_priority: 2,
            ..RuntimeConfig::default()
        };
        (Runtime::new(backend.clone(), config).unwrap(), backend)
    }

    #[test]
    fn test_uneven_split_shapes() {
        let (rt, _) = runtime(2);
        let data: Vec<i32> = (0..21).collect();
        let source = Buffer::from_slice(&rt, rt.device(0), &[7, 3], &data).unwrap();
        let chunks = Scatter::new(rt.devices()).apply(&source).unwrap();
        assert_eq!(chunks[0].shape(), &[4, 3]);
        assert_eq!(chunks[1].shape(), &[3, 3]);
        assert_eq!(chunks[1].device(), rt.device(1));
        assert_eq!(chunks[1].to_vec::<i32>().unwrap(), (12..21).collect::<Vec<_>>());
    }

    #[test]
    fn test_outputs_fenced_by_given_streams() {
        let (rt, _) = runtime(2);
        let source = Buffer::from_slice(&rt, rt.device(0), &[4], &[1u8, 2, 3, 4]).unwrap();
        let streams = vec![
            rt.stream(Some(rt.device(0)), 0).unwrap(),
            rt.stream(Some(rt.device(1)), -1).unwrap(),
        ];
        let chunks = Scatter::new(rt.devices())
            .with_streams(streams.iter().cloned().map(Some).collect())
            .apply(&source)
            .unwrap();
        for (chunk, stream) in chunks.iter().zip(&streams) {
            assert_eq!(chunk.last_writer().unwrap().stream(), stream);
        }
        assert_eq!(rt.current_device(), rt.device(0));
        assert_ne!(rt.current_stream(Some(rt.device(1))).unwrap(), streams[1]);
    }

    #[test]
    fn test_stream_count_checked_before_copies() {
        let (rt, backend) = runtime(2);
        let source = Buffer::from_slice(&rt, rt.device(0), &[4], &[0u16; 4]).unwrap();
        let err = Scatter::new(rt.devices())
            .with_streams(vec![Some(rt.stream(Some(rt.device(0)), 0).unwrap())])
            .apply(&source)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = Scatter::new(rt.devices())
            .with_streams(vec![
                Some(rt.stream(Some(rt.device(1)), 0).unwrap()),
                Some(rt.stream(Some(rt.device(1)), 0).unwrap()),
            ])
            .apply(&source)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDevice);
        assert_eq!(backend.copies_issued(), 0);
    }

    #[test]
    fn test_scalar_requires_unsqueeze() {
        let (rt, _) = runtime(2);
        let scalar = Buffer::from_slice(&rt, rt.device(0), &[], &[42u32]).unwrap();
        let err = Scatter::new(rt.devices()).apply(&scalar).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);

        let copies = Scatter::new(rt.devices())
            .with_unsqueeze_scalars(true)
            .apply(&scalar)
            .unwrap();
        assert_eq!(copies.len(), 2);
        for copy in &copies {
            assert_eq!(copy.shape(), &[1]);
            assert_eq!(copy.to_vec::<u32>().unwrap(), vec![42]);
        }
    }

    #[test]
    fn test_empty_device_list() {
        let (rt, _) = runtime(1);
        let source = Buffer::from_slice(&rt, rt.device(0), &[2], &[1u8, 2]).unwrap();
        let err = Scatter::new(Vec::new()).apply(&source).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_mixed_stream_list_falls_back_to_current() {
        let (rt, _) = runtime(3);
        let source = Buffer::from_slice(&rt, rt.device(0), &[3], &[5u8, 6, 7]).unwrap();
        let side = rt.stream(Some(rt.device(1)), 0).unwrap();
        let chunks = Scatter::new(rt.devices())
            .with_streams(vec![None, Some(side.clone()), None])
            .apply(&source)
            .unwrap();

        assert_eq!(
            chunks[0].last_writer().unwrap().stream(),
            &rt.current_stream(Some(rt.device(0))).unwrap()
        );
        assert_eq!(chunks[1].last_writer().unwrap().stream(), &side);
        assert_eq!(
            chunks[2].last_writer().unwrap().stream(),
            &rt.default_stream(rt.device(2)).unwrap()
        );
        assert_eq!(chunks[2].to_vec::<u8>().unwrap(), vec![7]);
    }
}
