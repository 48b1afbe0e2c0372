//! Command-driven asynchronous disk queue.
//!
//! The queue hides the disk beneath a staging pipeline: compute producers
//! borrow buffers from the work heap, fill them, and enqueue typed
//! commands; a single long-lived dispatcher thread drains the ring in
//! batches of up to 64 and executes each command in order against the
//! file-set registry.
//!
//! ```text
//!  producer                    ring                   dispatcher
//!  --------                    ----                   ----------
//!  get_buffer() ----+
//!  write_file() ----|--> stage command
//!  signal_fence() --|--> stage command
//!  commit_commands()|--> publish, raise ready --->  dequeue batch
//!                                                   raise consumed
//!  release_buffer() --> ...                         execute in order
//!  fence.wait_value() <------------------------     signal fence
//! ```
//!
//! # Ordering
//!
//! Commands published by one `commit_commands` call execute in enqueue
//! order, and never before the commands of an earlier commit. Writes to a
//! single `(file_id, bucket)` stream are therefore totally ordered. The
//! producer side is serialized internally; concurrent callers get no
//! relative ordering beyond that.
//!
//! # Failure policy
//!
//! Dispatch-path I/O failures are unrecoverable by design: the dispatcher
//! logs the stream identity and OS error and aborts the process. Surfacing
//! recoverable errors to producers would only hide real bugs in the
//! plotting pipeline. Setup-path failures (`new`, `init_file_set`,
//! `open_plot_file`) return `Result` so the orchestrator can report them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::command::{Command, FileId, SeekOrigin};
use crate::error::{Error, Result};
use crate::fence::{Fence, Signal};
use crate::fileset::{self, FileMode, FileRegistry};
use crate::heap::{BufferView, HeapBuffer, WorkHeap};
use crate::plot;
use crate::ring::{self, Consumer, Producer};

/// Commands the dispatcher drains per batch.
const COMMAND_BATCH: usize = 64;

pub struct DiskQueueOptions {
    /// Open work files with `O_DIRECT` and pad writes to block multiples.
    pub direct_io: bool,
    /// Command ring capacity; a power of two, at least 64.
    pub command_capacity: usize,
}

impl Default for DiskQueueOptions {
    fn default() -> Self {
        Self {
            direct_io: false,
            command_capacity: 256,
        }
    }
}

#[derive(Default)]
struct PlotInfo {
    /// Retained for the queue's lifetime; the in-flight header write
    /// points into it.
    header: Option<Box<[u8]>>,
    header_size: usize,
    tables_pointer_offset: u64,
}

struct Shared {
    registry: Mutex<FileRegistry>,
    heap: WorkHeap,
    cmd_ready: Signal,
    cmd_consumed: Signal,
    plot: Mutex<PlotInfo>,
}

pub struct DiskBufferQueue {
    shared: Arc<Shared>,
    producer: Mutex<Producer>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for DiskBufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskBufferQueue").finish_non_exhaustive()
    }
}

impl DiskBufferQueue {
    /// Creates the queue over an existing work directory with a work heap
    /// of `heap_size` bytes, and starts the dispatcher thread.
    pub fn new(
        work_dir: impl AsRef<Path>,
        heap_size: usize,
        options: DiskQueueOptions,
    ) -> Result<Self> {
        let work_dir: PathBuf = work_dir.as_ref().to_path_buf();
        if !work_dir.is_dir() {
            return Err(Error::InvalidInput(format!(
                "work directory {} does not exist",
                work_dir.display()
            )));
        }

        let shared = Arc::new(Shared {
            registry: Mutex::new(FileRegistry::new(work_dir, options.direct_io)),
            heap: WorkHeap::new(heap_size),
            cmd_ready: Signal::new(),
            cmd_consumed: Signal::new(),
            plot: Mutex::new(PlotInfo::default()),
        });

        let (producer, consumer) = ring::bounded(options.command_capacity);

        let dispatcher = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("plotdisk-io".to_string())
                .spawn(move || dispatch_main(shared, consumer))
                .map_err(|e| Error::IO(format!("failed to spawn dispatcher: {e}")))?
        };

        Ok(Self {
            shared,
            producer: Mutex::new(producer),
            dispatcher: Some(dispatcher),
        })
    }

    /// Opens the streams for a table. Called by the orchestrator before a
    /// phase touches the table; a failure here is fatal to the plot run.
    pub fn init_file_set(&self, file_id: FileId, name: &str, bucket_count: usize) -> Result<()> {
        self.init_file_set_with_mode(file_id, name, bucket_count, FileMode::Create)
    }

    /// `OpenOrCreate` variant for debug runs that reuse earlier tables.
    pub fn init_file_set_with_mode(
        &self,
        file_id: FileId,
        name: &str,
        bucket_count: usize,
        mode: FileMode,
    ) -> Result<()> {
        self.shared
            .registry
            .lock()
            .unwrap()
            .init_file_set(file_id, name, bucket_count, mode)
    }

    /// Opens the plot file, synthesizes its header, and enqueues the
    /// header write. Unlike temp tables a failed open is reported, not
    /// fatal: the orchestrator may retry with a different name.
    pub fn open_plot_file(
        &self,
        file_name: &str,
        plot_id: &[u8; plot::PLOT_ID_SIZE],
        memo: &[u8],
    ) -> Result<()> {
        {
            let mut registry = self.shared.registry.lock().unwrap();
            if let Err(e) = registry.init_file_set(FileId::Plot, file_name, 1, FileMode::Create) {
                tracing::error!(file = file_name, error = %e, "failed to open plot file");
                return Err(e);
            }
        }

        let (header, tables_pointer_offset) = plot::encode_header(plot_id, memo)?;
        let header_size = header.len();

        let view = {
            let mut plot = self.shared.plot.lock().unwrap();
            plot.header = Some(header.into_boxed_slice());
            plot.header_size = header_size;
            plot.tables_pointer_offset = tables_pointer_offset;
            let header = plot.header.as_mut().expect("header was just stored");
            BufferView::from_raw(header.as_mut_ptr(), header_size)
        };

        self.send(Command::WriteFile {
            file_id: FileId::Plot,
            bucket: 0,
            buffer: view,
            size: header_size,
        });
        self.commit_commands();
        Ok(())
    }

    /// Borrows a block-aligned buffer from the work heap, blocking until
    /// pending releases free enough space. Must follow at least one
    /// `init_file_set`, which fixes the block size.
    pub fn get_buffer(&self, len: usize) -> HeapBuffer {
        let block_size = self.shared.registry.lock().unwrap().block_size();
        assert!(
            block_size != 0,
            "get_buffer before any file set is initialized"
        );
        self.shared.heap.allocate(len, block_size)
    }

    /// Stages a bulk bucketed write. `buffer` must stay alive (and hold
    /// bucket `i`'s data at the rounded-up stride offset) until released
    /// behind this command.
    pub fn write_buckets(&self, file_id: FileId, buffer: &HeapBuffer, sizes: &[u32]) {
        self.send(Command::WriteBuckets {
            file_id,
            buffers: buffer.view(),
            sizes: sizes.into(),
        });
    }

    pub fn write_file(&self, file_id: FileId, bucket: u32, buffer: &HeapBuffer, size: usize) {
        self.send(Command::WriteFile {
            file_id,
            bucket,
            buffer: buffer.view(),
            size,
        });
    }

    /// Stages a read into `buffer`. The producer must not touch the buffer
    /// again until a fence behind this command signals.
    pub fn read_file(&self, file_id: FileId, bucket: u32, buffer: &mut HeapBuffer, size: usize) {
        self.send(Command::ReadFile {
            file_id,
            bucket,
            buffer: buffer.view(),
            size,
        });
    }

    pub fn seek_file(&self, file_id: FileId, bucket: u32, offset: i64, origin: SeekOrigin) {
        self.send(Command::SeekFile {
            file_id,
            bucket,
            offset,
            origin,
        });
    }

    /// Seeks every stream in the set.
    pub fn seek_bucket(&self, file_id: FileId, offset: i64, origin: SeekOrigin) {
        self.send(Command::SeekBucket {
            file_id,
            offset,
            origin,
        });
    }

    /// Returns the buffer to the heap once every command staged before
    /// this one has executed.
    pub fn release_buffer(&self, buffer: HeapBuffer) {
        self.send(Command::ReleaseBuffer { buffer });
    }

    pub fn signal_fence(&self, fence: &Arc<Fence>) {
        self.send(Command::SignalFence {
            fence: fence.clone(),
            value: None,
        });
    }

    pub fn signal_fence_value(&self, fence: &Arc<Fence>, value: u32) {
        self.send(Command::SignalFence {
            fence: fence.clone(),
            value: Some(value),
        });
    }

    /// Blocks the dispatcher on the fence, serializing it against other
    /// command streams. To wait in the calling thread, use
    /// [`Fence::wait`]/[`Fence::wait_value`] directly.
    pub fn wait_for_fence(&self, fence: &Arc<Fence>) {
        self.send(Command::WaitForFence {
            fence: fence.clone(),
        });
    }

    pub fn delete_file(&self, file_id: FileId, bucket: u32) {
        self.send(Command::DeleteFile { file_id, bucket });
    }

    pub fn delete_bucket(&self, file_id: FileId) {
        self.send(Command::DeleteBucket { file_id });
    }

    /// Publishes every staged command and wakes the dispatcher.
    pub fn commit_commands(&self) {
        self.producer.lock().unwrap().commit();
        self.shared.cmd_ready.signal();
    }

    /// Folds dispatcher-announced buffer releases into the heap's free
    /// space. The producer-side synchronization point of the heap.
    pub fn complete_pending_releases(&self) {
        self.shared.heap.complete_pending_releases();
    }

    /// Rebinds the work heap between passes. All buffers must have been
    /// released and reconciled.
    pub fn reset_heap(&self, heap_size: usize) {
        self.shared.heap.reset(heap_size);
    }

    /// Device block size shared by every work file; 0 before the first
    /// `init_file_set`.
    pub fn block_size(&self) -> usize {
        self.shared.registry.lock().unwrap().block_size()
    }

    pub fn plot_header_size(&self) -> usize {
        self.shared.plot.lock().unwrap().header_size
    }

    /// Offset of the zeroed 80-byte table-pointer region, patched by the
    /// orchestrator once the final tables land.
    pub fn plot_tables_pointer_offset(&self) -> u64 {
        self.shared.plot.lock().unwrap().tables_pointer_offset
    }

    /// Stages one command, blocking on the consumed signal while the ring
    /// is full. Producers must commit periodically; a producer that stages
    /// more than the ring capacity without committing starves itself.
    fn send(&self, cmd: Command) {
        let mut producer = self.producer.lock().unwrap();
        let mut cmd = cmd;
        loop {
            match producer.try_push(cmd) {
                Ok(()) => return,
                Err(back) => {
                    cmd = back;
                    tracing::warn!(
                        command = cmd.name(),
                        "command ring full, waiting for the dispatcher"
                    );
                    self.shared.cmd_consumed.wait();
                }
            }
        }
    }
}

impl Drop for DiskBufferQueue {
    fn drop(&mut self) {
        self.send(Command::Exit);
        self.commit_commands();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
    }
}

fn dispatch_main(shared: Arc<Shared>, mut consumer: Consumer) {
    let mut commands: Vec<Command> = Vec::with_capacity(COMMAND_BATCH);

    loop {
        shared.cmd_ready.wait();

        loop {
            commands.clear();
            if consumer.dequeue(&mut commands, COMMAND_BATCH) == 0 {
                break;
            }
            // Unblock any producer stalled on a full ring.
            shared.cmd_consumed.signal();

            for cmd in commands.drain(..) {
                if !execute_command(&shared, cmd) {
                    return;
                }
            }
        }
    }
}

/// Executes one command. Returns `false` on `Exit`.
fn execute_command(shared: &Shared, cmd: Command) -> bool {
    tracing::debug!(command = cmd.name(), "dispatching");

    match cmd {
        Command::WriteBuckets {
            file_id,
            buffers,
            sizes,
        } => {
            let mut registry = shared.registry.lock().unwrap();
            let direct = registry.direct_io();
            let (set, scratch, block_size) = registry.io_parts(file_id);
            let buffers = unsafe { buffers.as_slice() };
            if let Err(e) = fileset::write_buckets(set, buffers, &sizes, direct, block_size, scratch)
            {
                fatal(file_id, e);
            }
        }

        Command::WriteFile {
            file_id,
            bucket,
            buffer,
            size,
        } => {
            let mut registry = shared.registry.lock().unwrap();
            let direct = registry.direct_io();
            let (set, scratch, block_size) = registry.io_parts(file_id);
            let buffer = unsafe { buffer.as_slice() };
            if let Err(e) = fileset::write_to_file(
                set.stream_mut(bucket as usize),
                size,
                buffer,
                direct,
                block_size,
                scratch,
            ) {
                fatal(file_id, e);
            }
        }

        Command::ReadFile {
            file_id,
            bucket,
            buffer,
            size,
        } => {
            let mut registry = shared.registry.lock().unwrap();
            let direct = registry.direct_io();
            let (set, _, block_size) = registry.io_parts(file_id);
            let buffer = unsafe { buffer.as_mut_slice() };
            if let Err(e) = fileset::read_from_file(
                set.stream_mut(bucket as usize),
                size,
                buffer,
                direct,
                block_size,
            ) {
                fatal(file_id, e);
            }
        }

        Command::SeekFile {
            file_id,
            bucket,
            offset,
            origin,
        } => {
            let mut registry = shared.registry.lock().unwrap();
            let set = registry.set_mut(file_id);
            if let Err(e) = set.stream_mut(bucket as usize).seek(offset, origin) {
                fatal(file_id, e);
            }
        }

        Command::SeekBucket {
            file_id,
            offset,
            origin,
        } => {
            let mut registry = shared.registry.lock().unwrap();
            let set = registry.set_mut(file_id);
            for bucket in 0..set.bucket_count() {
                if let Err(e) = set.stream_mut(bucket).seek(offset, origin) {
                    fatal(file_id, e);
                }
            }
        }

        Command::ReleaseBuffer { buffer } => shared.heap.release(buffer),

        Command::SignalFence { fence, value } => match value {
            Some(value) => fence.signal_value(value),
            None => fence.signal(),
        },

        Command::WaitForFence { fence } => fence.wait(),

        Command::DeleteFile { file_id, bucket } => {
            let mut registry = shared.registry.lock().unwrap();
            registry.delete_file(file_id, bucket as usize);
        }

        Command::DeleteBucket { file_id } => {
            let mut registry = shared.registry.lock().unwrap();
            registry.delete_bucket(file_id);
        }

        Command::Exit => return false,
    }
    true
}

/// Dispatch-path failures terminate the process: the plot cannot be
/// salvaged and a soft error would only mask pipeline bugs.
fn fatal(file_id: FileId, err: Error) -> ! {
    tracing::error!(file = file_id.name(), error = %err, "unrecoverable disk I/O failure");
    std::process::abort();
}
