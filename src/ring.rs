//! Bounded single-producer/single-consumer command ring.
//!
//! Producers stage commands slot by slot and publish them atomically with
//! [`Producer::commit`]; the dispatcher pops committed commands in batches
//! with [`Consumer::dequeue`]. The staged/committed split is what lets a
//! producer enqueue a chain of writes plus a fence and make them visible
//! to the dispatcher in one step.
//!
//! Cursors grow monotonically and are masked into the slot array, so the
//! full/empty distinction never needs a spare slot. A `Release` store on
//! the committed cursor paired with an `Acquire` load in `dequeue` makes
//! every staged command body visible to the consumer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::command::Command;

pub const MIN_CAPACITY: usize = 64;

struct Shared {
    slots: Box<[UnsafeCell<MaybeUninit<Command>>]>,
    mask: usize,
    /// Next position the consumer will pop.
    head: AtomicUsize,
    /// End of the published region.
    committed: AtomicUsize,
    /// End of the staged region. Written only by the producer; read by
    /// `Drop` to reclaim staged-but-unpublished commands.
    staged: AtomicUsize,
}

unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Drop for Shared {
    fn drop(&mut self) {
        // Both halves are gone; anything between head and the staged end
        // is initialized and must be dropped.
        let head = self.head.load(Ordering::Relaxed);
        let staged = self.staged.load(Ordering::Relaxed);
        for pos in head..staged {
            unsafe {
                (*self.slots[pos & self.mask].get()).assume_init_drop();
            }
        }
    }
}

pub struct Producer {
    shared: Arc<Shared>,
    /// Local copy of the staged end.
    tail: usize,
    /// Local copy of the committed end.
    committed: usize,
}

pub struct Consumer {
    shared: Arc<Shared>,
    head: usize,
}

/// Creates a ring of `capacity` slots. Capacity must be a power of two and
/// at least [`MIN_CAPACITY`].
pub fn bounded(capacity: usize) -> (Producer, Consumer) {
    assert!(
        capacity >= MIN_CAPACITY && capacity.is_power_of_two(),
        "ring capacity must be a power of two >= {MIN_CAPACITY}"
    );

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        committed: AtomicUsize::new(0),
        staged: AtomicUsize::new(0),
    });

    (
        Producer {
            shared: shared.clone(),
            tail: 0,
            committed: 0,
        },
        Consumer { shared, head: 0 },
    )
}

impl Producer {
    /// Stages a command. Returns the command back when the ring is full so
    /// the caller can block and retry.
    pub fn try_push(&mut self, cmd: Command) -> Result<(), Command> {
        let head = self.shared.head.load(Ordering::Acquire);
        if self.tail - head == self.shared.slots.len() {
            return Err(cmd);
        }

        unsafe {
            (*self.shared.slots[self.tail & self.shared.mask].get()).write(cmd);
        }
        self.tail += 1;
        self.shared.staged.store(self.tail, Ordering::Relaxed);
        Ok(())
    }

    /// Number of staged commands not yet published.
    pub fn staged(&self) -> usize {
        self.tail - self.committed
    }

    /// Publishes every staged command to the consumer.
    pub fn commit(&mut self) {
        if self.tail != self.committed {
            self.shared.committed.store(self.tail, Ordering::Release);
            self.committed = self.tail;
        }
    }
}

impl Consumer {
    /// Pops up to `max` committed commands into `out`. Returns the number
    /// popped, 0 when the ring has no published commands.
    pub fn dequeue(&mut self, out: &mut Vec<Command>, max: usize) -> usize {
        let committed = self.shared.committed.load(Ordering::Acquire);
        let count = (committed - self.head).min(max);

        for i in 0..count {
            let slot = &self.shared.slots[(self.head + i) & self.shared.mask];
            out.push(unsafe { (*slot.get()).assume_init_read() });
        }

        self.head += count;
        self.shared.head.store(self.head, Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, FileId, SeekOrigin};
    use std::thread;

    fn seek(offset: i64) -> Command {
        Command::SeekFile {
            file_id: FileId::Y0,
            bucket: 0,
            offset,
            origin: SeekOrigin::Begin,
        }
    }

    fn offset_of(cmd: &Command) -> i64 {
        match cmd {
            Command::SeekFile { offset, .. } => *offset,
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_staged_commands_invisible_until_commit() {
        let (mut producer, mut consumer) = bounded(64);
        producer.try_push(seek(1)).unwrap();
        producer.try_push(seek(2)).unwrap();

        let mut out = Vec::new();
        assert_eq!(consumer.dequeue(&mut out, 64), 0);

        producer.commit();
        assert_eq!(consumer.dequeue(&mut out, 64), 2);
        assert_eq!(offset_of(&out[0]), 1);
        assert_eq!(offset_of(&out[1]), 2);
    }

    #[test]
    fn test_full_ring_rejects_push() {
        let (mut producer, mut consumer) = bounded(64);
        for i in 0..64 {
            producer.try_push(seek(i)).unwrap();
        }
        assert!(producer.try_push(seek(64)).is_err());

        producer.commit();
        let mut out = Vec::new();
        assert_eq!(consumer.dequeue(&mut out, 16), 16);

        // Space opens up exactly as commands are consumed.
        for i in 0..16 {
            producer.try_push(seek(64 + i)).unwrap();
        }
        assert!(producer.try_push(seek(100)).is_err());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = bounded(64);
        let mut out = Vec::new();
        let mut expected = 0i64;

        for round in 0..10 {
            for i in 0..48 {
                producer.try_push(seek(round * 48 + i)).unwrap();
            }
            producer.commit();

            while consumer.dequeue(&mut out, 7) > 0 {}
            for cmd in out.drain(..) {
                assert_eq!(offset_of(&cmd), expected);
                expected += 1;
            }
        }
        assert_eq!(expected, 480);
    }

    #[test]
    fn test_batch_dequeue_caps_at_max() {
        let (mut producer, mut consumer) = bounded(128);
        for i in 0..100 {
            producer.try_push(seek(i)).unwrap();
        }
        producer.commit();

        let mut out = Vec::new();
        assert_eq!(consumer.dequeue(&mut out, 64), 64);
        assert_eq!(consumer.dequeue(&mut out, 64), 36);
        assert_eq!(consumer.dequeue(&mut out, 64), 0);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (mut producer, mut consumer) = bounded(64);

        let consumer_thread = thread::spawn(move || {
            let mut out = Vec::new();
            let mut seen = Vec::new();
            while seen.len() < 1000 {
                out.clear();
                if consumer.dequeue(&mut out, 64) > 0 {
                    seen.extend(out.iter().map(offset_of));
                } else {
                    thread::yield_now();
                }
            }
            seen
        });

        let mut next = 0i64;
        while next < 1000 {
            let mut cmd = seek(next);
            loop {
                match producer.try_push(cmd) {
                    Ok(()) => break,
                    Err(back) => {
                        cmd = back;
                        producer.commit();
                        thread::yield_now();
                    }
                }
            }
            next += 1;
            if next % 13 == 0 {
                producer.commit();
            }
        }
        producer.commit();

        let seen = consumer_thread.join().unwrap();
        assert_eq!(seen, (0..1000).collect::<Vec<i64>>());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_capacity_validation() {
        bounded(48);
    }
}
