use thiserror::Error;

use crate::device::Device;

/// Errors raised by streams, events, guards, buffers and the collective ops
/// built on top of them.
///
/// Every variant names the operation that failed so callers can tell which
/// call surfaced it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Device index out of range, or a device of a kind the backend does not drive
    #[error("{op}: invalid device {device} ({reason})")]
    InvalidDevice {
        op: &'static str,
        device: Device,
        reason: String,
    },

    /// Contradictory or out-of-range construction parameters
    #[error("{op}: invalid configuration: {reason}")]
    InvalidConfig { op: &'static str, reason: String },

    /// Split sizes, dimensions or shapes that do not line up
    #[error("{op}: shape mismatch: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },

    /// Timing query on events that have not both completed
    #[error("{op}: event has not completed yet")]
    NotReady { op: &'static str },

    /// Timing query on an event created without timing
    #[error("{op}: event was created without timing enabled")]
    TimingDisabled { op: &'static str },

    /// Interprocess handle requested from, or imported into, a non-shareable event
    #[error("{op}: event is not interprocess-shareable ({reason})")]
    NotShareable { op: &'static str, reason: String },

    /// The device runtime failed while allocating, copying or driving a queue
    #[error("{op}: hardware failure on {device}: {reason}")]
    Hardware {
        op: &'static str,
        device: Device,
        reason: String,
    },
}

/// Coarse classification of [`Error`], handy for matching in callers and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidDevice,
    InvalidConfig,
    ShapeMismatch,
    NotReady,
    TimingDisabled,
    NotShareable,
    Hardware,
}

impl Error {
    pub fn invalid_device(op: &'static str, device: Device, reason: impl Into<String>) -> Self {
        Self::InvalidDevice {
            op,
            device,
            reason: reason.into(),
        }
    }

    pub fn invalid_config(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            op,
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(op: &'static str, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            op,
            reason: reason.into(),
        }
    }

    pub fn not_shareable(op: &'static str, reason: impl Into<String>) -> Self {
        Self::NotShareable {
            op,
            reason: reason.into(),
        }
    }

    pub fn hardware(op: &'static str, device: Device, reason: impl Into<String>) -> Self {
        Self::Hardware {
            op,
            device,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidDevice { .. } => ErrorKind::InvalidDevice,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::TimingDisabled { .. } => ErrorKind::TimingDisabled,
            Self::NotShareable { .. } => ErrorKind::NotShareable,
            Self::Hardware { .. } => ErrorKind::Hardware,
        }
    }

    /// Name of the operation that raised this error
    pub fn op(&self) -> &'static str {
        match self {
            Self::InvalidDevice { op, .. }
            | Self::InvalidConfig { op, .. }
            | Self::ShapeMismatch { op, .. }
            | Self::NotReady { op }
            | Self::TimingDisabled { op }
            | Self::NotShareable { op, .. }
            | Self::Hardware { op, .. } => op,
        }
    }
}

/// Convenience Result type for stream, event and buffer operations
pub type Result<T> = std::result::Result<T, Error>;
