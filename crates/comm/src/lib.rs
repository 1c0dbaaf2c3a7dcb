//! Scatter and gather across devices
//!
//! Both operators are written against [`xstream_core::Runtime`] and its
//! backend trait only. Ordering between the copies they issue and the work
//! that produced or consumes the buffers comes from each buffer's fence.

pub mod gather;
pub mod plan;
pub mod scatter;

pub use gather::Gather;
pub use plan::{Chunk, ChunkPlan};
pub use scatter::Scatter;
