pub mod bits;
pub mod buffer;
pub mod command;
pub mod error;
pub mod fence;
pub mod fileset;
pub mod heap;
pub mod plot;
pub mod queue;
pub mod ring;

#[cfg(test)]
pub(crate) mod tmpfs;

pub use bits::BitReader;
pub use command::{Command, FileId, SeekOrigin};
pub use error::{Error, Result};
pub use fence::Fence;
pub use heap::{HeapBuffer, WorkHeap};
pub use queue::{DiskBufferQueue, DiskQueueOptions};

/// Stream count of bucketed table sets.
pub const BUCKET_COUNT: usize = 64;
