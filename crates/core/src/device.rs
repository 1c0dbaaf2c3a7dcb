//! Device identifiers
//!
//! A [`Device`] is an opaque (kind, index) pair naming one accelerator. It
//! carries no state of its own; streams, events and buffers record the device
//! they belong to and the runtime validates it against its backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Family of accelerator a backend drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Cuda,
    Rocm,
    /// In-process simulated accelerator (see [`crate::sim::SimBackend`])
    Sim,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
            Self::Sim => "sim",
        }
    }
}

/// One accelerator: a device kind plus an ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    kind: DeviceKind,
    index: usize,
}

impl Device {
    pub const fn new(kind: DeviceKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub const fn sim(index: usize) -> Self {
        Self::new(DeviceKind::Sim, index)
    }

    pub const fn cuda(index: usize) -> Self {
        Self::new(DeviceKind::Cuda, index)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)
    }
}
