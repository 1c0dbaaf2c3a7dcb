//! Strided views and copy planning
//!
//! A [`Layout`] describes which elements of an allocation a buffer view
//! covers: a shape, per-dimension strides and a starting offset, all counted
//! in elements. [`copy_runs`] turns a pair of equally shaped views into the
//! list of contiguous byte ranges a device copy has to move.

use crate::backend::CopyRun;
use crate::error::{Error, Result};

/// Row-major strides for `shape`
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(1);
    }
    strides
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    pub fn contiguous(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            offset: 0,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&extent, (&actual, &want))| extent <= 1 || actual == want)
    }

    /// View of `len` entries starting at `start` along `dim`
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        if dim >= self.ndim() {
            return Err(Error::shape_mismatch(
                "narrow",
                format!("dim {} out of range for {} dimensions", dim, self.ndim()),
            ));
        }
        if start + len > self.shape[dim] {
            return Err(Error::shape_mismatch(
                "narrow",
                format!(
                    "range {}..{} exceeds extent {} of dim {}",
                    start,
                    start + len,
                    self.shape[dim],
                    dim
                ),
            ));
        }
        let mut view = self.clone();
        view.shape[dim] = len;
        if len > 0 {
            view.offset += start * self.strides[dim];
        }
        Ok(view)
    }

    /// View with a new extent-1 axis inserted at `dim`
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.ndim() {
            return Err(Error::shape_mismatch(
                "unsqueeze",
                format!("dim {} out of range for {} dimensions", dim, self.ndim()),
            ));
        }
        let stride = if dim < self.ndim() {
            self.shape[dim] * self.strides[dim]
        } else {
            1
        };
        let mut view = self.clone();
        view.shape.insert(dim, 1);
        view.strides.insert(dim, stride.max(1));
        Ok(view)
    }

    /// Number of trailing dims over which this view is row-major contiguous
    fn contiguous_suffix(&self) -> usize {
        let mut expected = 1;
        let mut count = 0;
        for i in (0..self.ndim()).rev() {
            if self.shape[i] > 1 && self.strides[i] != expected {
                break;
            }
            expected *= self.shape[i];
            count += 1;
        }
        count
    }
}

/// Contiguous byte runs copying every element of `src` into the matching
/// element of `dst`. Adjacent runs are merged.
pub fn copy_runs(src: &Layout, dst: &Layout, elem_size: usize) -> Result<Vec<CopyRun>> {
    if src.shape != dst.shape {
        return Err(Error::shape_mismatch(
            "copy_runs",
            format!("source {:?} vs destination {:?}", src.shape, dst.shape),
        ));
    }
    if src.numel() == 0 {
        return Ok(Vec::new());
    }

    let ndim = src.ndim();
    let inner = src.contiguous_suffix().min(dst.contiguous_suffix());
    let outer = ndim - inner;
    let block: usize = src.shape[outer..].iter().product();
    let run_len = block * elem_size;

    let mut runs: Vec<CopyRun> = Vec::new();
    let mut index = vec![0usize; outer];
    loop {
        let src_elem: usize = src.offset
            + index
                .iter()
                .zip(&src.strides)
                .map(|(i, s)| i * s)
                .sum::<usize>();
        let dst_elem: usize = dst.offset
            + index
                .iter()
                .zip(&dst.strides)
                .map(|(i, s)| i * s)
                .sum::<usize>();
        let run = CopyRun {
            src_offset: src_elem * elem_size,
            dst_offset: dst_elem * elem_size,
            len: run_len,
        };
        match runs.last_mut() {
            Some(last)
                if last.src_offset + last.len == run.src_offset
                    && last.dst_offset + last.len == run.dst_offset =>
            {
                last.len += run.len;
            }
            _ => runs.push(run),
        }

        // odometer over the outer dims
        let mut dim = outer;
        loop {
            if dim == 0 {
                return Ok(runs);
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < src.shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}
