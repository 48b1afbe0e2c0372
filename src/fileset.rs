//! File-set registry and block-aligned stream I/O.
//!
//! Every logical table is a named set of per-bucket file streams under the
//! work directory: `<work_dir>/<name>_<bucket>.tmp` for temporary tables,
//! `<work_dir>/<name>` for the plot file itself. The first stream opened
//! fixes the device block size for the whole registry and backs a single
//! scratch block used to pad direct-I/O write tails; temp files reporting
//! a different block size fail initialization.
//!
//! # Direct I/O
//!
//! With `O_DIRECT` enabled, writes are always a whole number of blocks:
//! the aligned prefix of the caller's buffer goes out as-is and a short
//! tail is copied into the zeroed scratch block and written as one full
//! block. The padding bytes become part of the stream, so callers must
//! not write another logical region behind a padded tail within the same
//! pass; bucket writes are one-shot per pass by contract. Reads round the
//! requested size up to a block multiple; buffers are block-aligned by
//! construction, and reading past end of file is an error.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use crate::buffer::AlignedBuffer;
use crate::command::{FileId, SeekOrigin};
use crate::error::{Error, Result};

/// Creation policy for a stream. Temporary tables and the plot file
/// truncate; `OpenOrCreate` exists for debug runs that reuse tables from
/// an earlier pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Create,
    OpenOrCreate,
}

pub struct FileStream {
    file: fs::File,
    path: PathBuf,
    block_size: usize,
}

impl FileStream {
    pub fn open(path: &Path, mode: FileMode, direct_io: bool) -> Result<Self> {
        let mut opts = fs::File::options();
        opts.read(true).write(true).create(true);
        if mode == FileMode::Create {
            opts.truncate(true);
        }

        #[cfg(target_os = "linux")]
        if direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct_io;

        let file = opts
            .open(path)
            .map_err(|e| Error::IO(format!("failed to open {}: {e}", path.display())))?;

        let block_size = {
            use std::os::unix::fs::MetadataExt;
            file.metadata()
                .map_err(|e| Error::IO(format!("failed to stat {}: {e}", path.display())))?
                .blksize() as usize
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        self.file
            .seek(origin.to_seek_from(offset))
            .map_err(|e| Error::IO(format!("failed to seek {}: {e}", self.path.display())))
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

pub struct FileSet {
    name: String,
    streams: Vec<Option<FileStream>>,
}

impl FileSet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_mut(&mut self, bucket: usize) -> &mut FileStream {
        self.streams[bucket]
            .as_mut()
            .expect("file stream was deleted")
    }
}

/// Named mapping of [`FileId`] tags to file sets, plus the registry-wide
/// block size and the scratch block for direct-I/O tails.
pub struct FileRegistry {
    work_dir: PathBuf,
    direct_io: bool,
    sets: HashMap<FileId, FileSet>,
    block_size: usize,
    scratch: Option<AlignedBuffer>,
}

impl FileRegistry {
    pub fn new(work_dir: PathBuf, direct_io: bool) -> Self {
        Self {
            work_dir,
            direct_io,
            sets: HashMap::new(),
            block_size: 0,
            scratch: None,
        }
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Block size recorded from the first opened stream; 0 before any set
    /// is initialized.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn temp_path(&self, name: &str, bucket: usize) -> PathBuf {
        self.work_dir.join(format!("{name}_{bucket}.tmp"))
    }

    /// Opens `bucket_count` streams for `file_id` under `name`. The plot
    /// file's path is `<work_dir>/<name>` verbatim; everything else is
    /// `<work_dir>/<name>_<bucket>.tmp`.
    pub fn init_file_set(
        &mut self,
        file_id: FileId,
        name: &str,
        bucket_count: usize,
        mode: FileMode,
    ) -> Result<()> {
        assert!(bucket_count > 0, "file set needs at least one stream");

        let mut streams = Vec::with_capacity(bucket_count);
        for bucket in 0..bucket_count {
            let path = if file_id == FileId::Plot {
                self.work_dir.join(name)
            } else {
                self.temp_path(name, bucket)
            };

            let stream = FileStream::open(&path, mode, self.direct_io)?;

            if self.block_size == 0 {
                let block_size = stream.block_size();
                if block_size < 2 {
                    return Err(Error::IO(format!(
                        "invalid block size {block_size} for {}",
                        path.display()
                    )));
                }
                self.block_size = block_size;
                self.scratch = Some(AlignedBuffer::new(block_size, block_size));
            } else if file_id != FileId::Plot && stream.block_size() != self.block_size {
                return Err(Error::IO(format!(
                    "work file {} reports block size {} but the registry uses {}",
                    path.display(),
                    stream.block_size(),
                    self.block_size
                )));
            }

            streams.push(Some(stream));
        }

        self.sets.insert(
            file_id,
            FileSet {
                name: name.to_string(),
                streams,
            },
        );
        Ok(())
    }

    pub fn set_mut(&mut self, file_id: FileId) -> &mut FileSet {
        self.sets
            .get_mut(&file_id)
            .expect("file set not initialized")
    }

    /// Splits out the pieces a dispatch-path write or read needs: the set,
    /// the scratch block, and the block size.
    pub fn io_parts(&mut self, file_id: FileId) -> (&mut FileSet, &mut [u8], usize) {
        let set = self
            .sets
            .get_mut(&file_id)
            .expect("file set not initialized");
        let scratch = &mut self.scratch.as_mut().expect("no file set initialized")[..];
        (set, scratch, self.block_size)
    }

    /// Closes and unlinks one stream. Unlink failure is logged and
    /// swallowed.
    pub fn delete_file(&mut self, file_id: FileId, bucket: usize) {
        let set = self
            .sets
            .get_mut(&file_id)
            .expect("file set not initialized");
        set.streams[bucket].take();
        let name = set.name.clone();

        let path = self.temp_path(&name, bucket);
        if let Err(e) = fs::remove_file(&path) {
            tracing::error!(path = %path.display(), error = %e, "failed to delete work file");
        }
    }

    /// Closes and unlinks every stream of the set and forgets it; a later
    /// `init_file_set` for the same tag starts fresh.
    pub fn delete_bucket(&mut self, file_id: FileId) {
        let set = match self.sets.remove(&file_id) {
            Some(set) => set,
            None => panic!("file set not initialized"),
        };

        for (bucket, stream) in set.streams.into_iter().enumerate() {
            drop(stream);
            let path = self.temp_path(&set.name, bucket);
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!(path = %path.display(), error = %e, "failed to delete work file");
            }
        }
    }
}

/// Writes `size` bytes from `buffer` to `stream`, looping over short
/// writes. In direct mode the aligned prefix goes out as-is and a short
/// tail is padded through the zeroed scratch block, growing the file to
/// the next block multiple.
pub(crate) fn write_to_file(
    stream: &mut FileStream,
    size: usize,
    buffer: &[u8],
    direct: bool,
    block_size: usize,
    scratch: &mut [u8],
) -> Result<()> {
    if !direct {
        return write_all(stream, &buffer[..size]);
    }

    let aligned = size / block_size * block_size;
    let remainder = size - aligned;

    write_all(stream, &buffer[..aligned])?;

    if remainder > 0 {
        scratch.fill(0);
        scratch[..remainder].copy_from_slice(&buffer[aligned..size]);
        write_all(stream, &scratch[..block_size])?;
    }
    Ok(())
}

fn write_all(stream: &mut FileStream, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let written = stream
            .write(buf)
            .map_err(|e| Error::IO(format!("failed to write {}: {e}", stream.path().display())))?;
        if written == 0 {
            return Err(Error::IO(format!(
                "wrote 0 bytes to {}",
                stream.path().display()
            )));
        }
        buf = &buf[written..];
    }
    Ok(())
}

/// Reads `size` bytes into `buffer`, looping until complete. In direct
/// mode the size is rounded up to a block multiple; the buffer is block
/// aligned and oversized by construction. Hitting end of file is an error.
pub(crate) fn read_from_file(
    stream: &mut FileStream,
    size: usize,
    buffer: &mut [u8],
    direct: bool,
    block_size: usize,
) -> Result<()> {
    let read_size = if direct {
        size.div_ceil(block_size) * block_size
    } else {
        size
    };

    let mut buf = &mut buffer[..read_size];
    while !buf.is_empty() {
        let read = stream
            .read(buf)
            .map_err(|e| Error::IO(format!("failed to read {}: {e}", stream.path().display())))?;
        if read == 0 {
            return Err(Error::IO(format!(
                "unexpected end of file reading {}",
                stream.path().display()
            )));
        }
        buf = &mut buf[read..];
    }
    Ok(())
}

/// Bulk bucketed write: bucket `i` takes the slice at the running offset,
/// writing only the block-aligned portion in direct mode. The offset then
/// advances by the rounded-up stride, so each bucket's data starts block
/// aligned in memory; the unwritten tail is the compute layer's to carry.
pub(crate) fn write_buckets(
    set: &mut FileSet,
    buffers: &[u8],
    sizes: &[u32],
    direct: bool,
    block_size: usize,
    scratch: &mut [u8],
) -> Result<()> {
    assert_eq!(
        sizes.len(),
        set.bucket_count(),
        "bucket write size count does not match the file set"
    );

    let mut offset = 0usize;
    for (bucket, &size) in sizes.iter().enumerate() {
        let size = size as usize;
        let write_size = if direct {
            size / block_size * block_size
        } else {
            size
        };

        write_to_file(
            set.stream_mut(bucket),
            write_size,
            &buffers[offset..],
            direct,
            block_size,
            scratch,
        )?;

        offset += if direct {
            size.div_ceil(block_size) * block_size
        } else {
            size
        };
    }
    Ok(())
}
