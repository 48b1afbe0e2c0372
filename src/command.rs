//! Typed commands posted from compute producers to the I/O dispatcher.

use std::io::SeekFrom;
use std::sync::Arc;

use crate::fence::Fence;
use crate::heap::{BufferView, HeapBuffer};
use crate::BUCKET_COUNT;

/// Tag identifying a logical table. Each tag maps to exactly one file set
/// in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileId {
    Y0,
    Y1,
    MetaA0,
    MetaA1,
    MetaB0,
    MetaB1,
    X,
    F7,
    T2L,
    T2R,
    T3L,
    T3R,
    T4L,
    T4R,
    T5L,
    T5R,
    T6L,
    T6R,
    T7L,
    T7R,
    SortKey2,
    SortKey3,
    SortKey4,
    SortKey5,
    SortKey6,
    SortKey7,
    Map2,
    Map3,
    Map4,
    Map5,
    Map6,
    Map7,
    MarkedEntries2,
    MarkedEntries3,
    MarkedEntries4,
    MarkedEntries5,
    MarkedEntries6,
    Plot,
}

impl FileId {
    /// Canonical on-disk set name. The plot file's real name is supplied by
    /// the caller at open time; `"plot"` here is only used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FileId::Y0 => "y0",
            FileId::Y1 => "y1",
            FileId::MetaA0 => "meta_a0",
            FileId::MetaA1 => "meta_a1",
            FileId::MetaB0 => "meta_b0",
            FileId::MetaB1 => "meta_b1",
            FileId::X => "x",
            FileId::F7 => "f7",
            FileId::T2L => "table_2_l",
            FileId::T2R => "table_2_r",
            FileId::T3L => "table_3_l",
            FileId::T3R => "table_3_r",
            FileId::T4L => "table_4_l",
            FileId::T4R => "table_4_r",
            FileId::T5L => "table_5_l",
            FileId::T5R => "table_5_r",
            FileId::T6L => "table_6_l",
            FileId::T6R => "table_6_r",
            FileId::T7L => "table_7_l",
            FileId::T7R => "table_7_r",
            FileId::SortKey2 => "table_2_key",
            FileId::SortKey3 => "table_3_key",
            FileId::SortKey4 => "table_4_key",
            FileId::SortKey5 => "table_5_key",
            FileId::SortKey6 => "table_6_key",
            FileId::SortKey7 => "table_7_key",
            FileId::Map2 => "table_2_map",
            FileId::Map3 => "table_3_map",
            FileId::Map4 => "table_4_map",
            FileId::Map5 => "table_5_map",
            FileId::Map6 => "table_6_map",
            FileId::Map7 => "table_7_map",
            FileId::MarkedEntries2 => "table_2_marks",
            FileId::MarkedEntries3 => "table_3_marks",
            FileId::MarkedEntries4 => "table_4_marks",
            FileId::MarkedEntries5 => "table_5_marks",
            FileId::MarkedEntries6 => "table_6_marks",
            FileId::Plot => "plot",
        }
    }

    /// Stream count of the canonical layout: bucketed tables hold
    /// [`BUCKET_COUNT`] streams, table halves, mark bitfields, and the plot
    /// file one.
    pub fn bucket_count(self) -> usize {
        match self {
            FileId::Y0
            | FileId::Y1
            | FileId::MetaA0
            | FileId::MetaA1
            | FileId::MetaB0
            | FileId::MetaB1
            | FileId::X
            | FileId::F7
            | FileId::SortKey2
            | FileId::SortKey3
            | FileId::SortKey4
            | FileId::SortKey5
            | FileId::SortKey6
            | FileId::SortKey7
            | FileId::Map2
            | FileId::Map3
            | FileId::Map4
            | FileId::Map5
            | FileId::Map6
            | FileId::Map7 => BUCKET_COUNT,
            _ => 1,
        }
    }

    /// Every tag, in declaration order.
    pub fn all() -> impl Iterator<Item = FileId> {
        const ALL: [FileId; 38] = [
            FileId::Y0,
            FileId::Y1,
            FileId::MetaA0,
            FileId::MetaA1,
            FileId::MetaB0,
            FileId::MetaB1,
            FileId::X,
            FileId::F7,
            FileId::T2L,
            FileId::T2R,
            FileId::T3L,
            FileId::T3R,
            FileId::T4L,
            FileId::T4R,
            FileId::T5L,
            FileId::T5R,
            FileId::T6L,
            FileId::T6R,
            FileId::T7L,
            FileId::T7R,
            FileId::SortKey2,
            FileId::SortKey3,
            FileId::SortKey4,
            FileId::SortKey5,
            FileId::SortKey6,
            FileId::SortKey7,
            FileId::Map2,
            FileId::Map3,
            FileId::Map4,
            FileId::Map5,
            FileId::Map6,
            FileId::Map7,
            FileId::MarkedEntries2,
            FileId::MarkedEntries3,
            FileId::MarkedEntries4,
            FileId::MarkedEntries5,
            FileId::MarkedEntries6,
            FileId::Plot,
        ];
        ALL.into_iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

impl SeekOrigin {
    pub fn to_seek_from(self, offset: i64) -> SeekFrom {
        match self {
            SeekOrigin::Begin => SeekFrom::Start(offset as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        }
    }
}

/// One unit of I/O work. Commands are executed strictly in enqueue order
/// by the single dispatcher thread.
#[derive(Debug)]
pub enum Command {
    /// Bulk bucketed write: one block-aligned slice per stream of the set,
    /// packed back to back at rounded-up strides.
    WriteBuckets {
        file_id: FileId,
        buffers: BufferView,
        sizes: Box<[u32]>,
    },
    WriteFile {
        file_id: FileId,
        bucket: u32,
        buffer: BufferView,
        size: usize,
    },
    ReadFile {
        file_id: FileId,
        bucket: u32,
        buffer: BufferView,
        size: usize,
    },
    SeekFile {
        file_id: FileId,
        bucket: u32,
        offset: i64,
        origin: SeekOrigin,
    },
    /// Seek applied to every stream in the set.
    SeekBucket {
        file_id: FileId,
        offset: i64,
        origin: SeekOrigin,
    },
    ReleaseBuffer {
        buffer: HeapBuffer,
    },
    /// `value: None` signals without publishing a value.
    SignalFence {
        fence: Arc<Fence>,
        value: Option<u32>,
    },
    WaitForFence {
        fence: Arc<Fence>,
    },
    DeleteFile {
        file_id: FileId,
        bucket: u32,
    },
    /// Closes and unlinks every stream in the set.
    DeleteBucket {
        file_id: FileId,
    },
    /// Stops the dispatcher after everything enqueued before it ran.
    Exit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::WriteBuckets { .. } => "WriteBuckets",
            Command::WriteFile { .. } => "WriteFile",
            Command::ReadFile { .. } => "ReadFile",
            Command::SeekFile { .. } => "SeekFile",
            Command::SeekBucket { .. } => "SeekBucket",
            Command::ReleaseBuffer { .. } => "ReleaseBuffer",
            Command::SignalFence { .. } => "SignalFence",
            Command::WaitForFence { .. } => "WaitForFence",
            Command::DeleteFile { .. } => "DeleteFile",
            Command::DeleteBucket { .. } => "DeleteBucket",
            Command::Exit => "Exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_layout() {
        assert_eq!(FileId::Y0.name(), "y0");
        assert_eq!(FileId::Map2.name(), "table_2_map");
        assert_eq!(FileId::MarkedEntries6.name(), "table_6_marks");

        assert_eq!(FileId::Y0.bucket_count(), BUCKET_COUNT);
        assert_eq!(FileId::SortKey7.bucket_count(), BUCKET_COUNT);
        assert_eq!(FileId::T2L.bucket_count(), 1);
        assert_eq!(FileId::MarkedEntries2.bucket_count(), 1);
        assert_eq!(FileId::Plot.bucket_count(), 1);
    }

    #[test]
    fn test_all_tags_unique() {
        let tags: Vec<FileId> = FileId::all().collect();
        assert_eq!(tags.len(), 38);
        for (i, a) in tags.iter().enumerate() {
            for b in &tags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
