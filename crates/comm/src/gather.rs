//! Gather: concatenate per-device buffers on one device
//!
//! Shapes are checked and the output allocated before any copy is issued.
//! Each copy waits for its source's last writer; the output gets a single
//! fence recorded after the last copy. The calling thread's current streams
//! are not touched.

use tracing::{debug, warn};
use xstream_core::{Buffer, Device, Error, Result, Stream};

#[derive(Debug, Clone)]
pub struct Gather {
    destination: Device,
    dim: usize,
    stream: Option<Stream>,
}

impl Gather {
    pub fn new(destination: Device) -> Self {
        Self {
            destination,
            dim: 0,
            stream: None,
        }
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Copy on `stream` instead of the destination's current stream
    pub fn with_stream(mut self, stream: Stream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn destination(&self) -> Device {
        self.destination
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn apply(&self, inputs: &[Buffer]) -> Result<Buffer> {
        let op = "Gather::apply";
        let Some(first) = inputs.first() else {
            return Err(Error::invalid_config(op, "no input buffers"));
        };
        let runtime = first.runtime();
        runtime.check_device(op, self.destination)?;

        let stream = match &self.stream {
            Some(stream) => {
                if stream.device() != self.destination {
                    return Err(Error::invalid_device(
                        op,
                        stream.device(),
                        format!("gather destination is {}", self.destination),
                    ));
                }
                stream.clone()
            }
            None => runtime.current_stream(Some(self.destination))?,
        };

        for input in inputs {
            if !runtime.same(input.runtime()) || !runtime.same(stream.runtime()) {
                return Err(Error::invalid_config(op, "inputs belong to different runtimes"));
            }
            if input.elem_size() != first.elem_size() {
                return Err(Error::shape_mismatch(
                    op,
                    format!(
                        "element size {} vs {}",
                        input.elem_size(),
                        first.elem_size()
                    ),
                ));
            }
        }

        let inputs: Vec<Buffer> = if inputs.iter().all(|b| b.ndim() == 0) {
            if self.dim != 0 {
                return Err(Error::shape_mismatch(
                    op,
                    format!("scalar inputs can only be gathered along dim 0, got {}", self.dim),
                ));
            }
            warn!(
                count = inputs.len(),
                "Gathering scalars; each is unsqueezed into a 1-element vector"
            );
            inputs.iter().map(|b| b.unsqueeze(0)).collect::<Result<_>>()?
        } else {
            inputs.to_vec()
        };

        let shape = concat_shape(op, &inputs, self.dim)?;
        let output = Buffer::empty(runtime, self.destination, &shape, first.elem_size())?;
        debug!(
            inputs = inputs.len(),
            destination = %self.destination,
            dim = self.dim,
            ?shape,
            "Gather"
        );

        let mut offset = 0;
        for input in &inputs {
            let extent = input.shape()[self.dim];
            output
                .narrow(self.dim, offset, extent)?
                .enqueue_copy_from(input, &stream)?;
            offset += extent;
        }
        output.mark_written(&stream)?;
        Ok(output)
    }
}

/// Output shape of concatenating `inputs` along `dim`
fn concat_shape(op: &'static str, inputs: &[Buffer], dim: usize) -> Result<Vec<usize>> {
    let reference = inputs[0].shape();
    if dim >= reference.len() {
        return Err(Error::shape_mismatch(
            op,
            format!("dim {} out of range for {} dimensions", dim, reference.len()),
        ));
    }
    let mut shape = reference.to_vec();
    shape[dim] = 0;
    for (i, input) in inputs.iter().enumerate() {
        let candidate = input.shape();
        let compatible = candidate.len() == reference.len()
            && candidate
                .iter()
                .zip(reference)
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !compatible {
            return Err(Error::shape_mismatch(
                op,
                format!(
                    "input {} has shape {:?}, expected {:?} outside dim {}",
                    i, candidate, reference, dim
                ),
            ));
        }
        shape[dim] += candidate[dim];
    }
    Ok(shape)
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
    fn test_concat_along_dim1() {
        let (rt, _) = runtime(2);
        let a = Buffer::from_slice(&rt, rt.device(0), &[2, 1], &[1i64, 4]).unwrap();
        let b = Buffer::from_slice(&rt, rt.device(1), &[2, 2], &[2i64, 3, 5, 6]).unwrap();
        let out = Gather::new(rt.device(1)).with_dim(1).apply(&[a, b]).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.device(), rt.device(1));
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_single_fence_on_given_stream() {
        let (rt, _) = runtime(2);
        let a = Buffer::from_slice(&rt, rt.device(0), &[1], &[1u8]).unwrap();
        let b = Buffer::from_slice(&rt, rt.device(1), &[1], &[2u8]).unwrap();
        let stream = rt.stream(Some(rt.device(0)), 0).unwrap();
        let out = Gather::new(rt.device(0))
            .with_stream(stream.clone())
            .apply(&[a, b])
            .unwrap();
        assert_eq!(out.last_writer().unwrap().stream(), &stream);
        assert_ne!(rt.current_stream(Some(rt.device(0))).unwrap(), stream);
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_stream_on_wrong_device() {
        let (rt, _) = runtime(2);
        let a = Buffer::from_slice(&rt, rt.device(0), &[1], &[1u8]).unwrap();
        let err = Gather::new(rt.device(0))
            .with_stream(rt.stream(Some(rt.device(1)), 0).unwrap())
            .apply(&[a])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDevice);
    }

    #[test]
    fn test_scalars_unsqueezed() {
        let (rt, _) = runtime(2);
        let a = Buffer::from_slice(&rt, rt.device(0), &[], &[1.5f32]).unwrap();
        let b = Buffer::from_slice(&rt, rt.device(1), &[], &[2.5f32]).unwrap();
        let out = Gather::new(rt.device(0)).apply(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.to_vec::<f32>().unwrap(), vec![1.5, 2.5]);

        let err = Gather::new(rt.device(0)).with_dim(1).apply(&[a, b]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_no_inputs() {
        let (rt, _) = runtime(1);
        let err = Gather::new(rt.device(0)).apply(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
