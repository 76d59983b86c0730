// # Bounded Lock-Free MPMC Queue
//
// Fixed-capacity ring buffer with one sequence atomic per slot. Producers
// and consumers claim positions with CAS; the slot sequence tells each side
// whether the cell is ready for it. Acquire/release pairs on the sequence
// publish the cell contents.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Slots
// ============================================================================

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Cache-line separation for the producer and consumer cursors.
#[repr(align(64))]
struct CachePadded<T>(T);

// ============================================================================
// BoundedLockFreeQueue
// ============================================================================

pub struct BoundedLockFreeQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for BoundedLockFreeQueue<T> {}
unsafe impl<T: Send> Sync for BoundedLockFreeQueue<T> {}

impl<T> BoundedLockFreeQueue<T> {
    /// Create a queue holding at least `capacity` items. Capacity is rounded
    /// up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let buffer: Box<[Slot<T>]> = (0..cap)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buffer,
            mask: cap - 1,
            enqueue_pos: CachePadded(AtomicUsize::new(0)),
            dequeue_pos: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate occupancy; exact only when quiescent.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.0.load(Ordering::Relaxed);
        let head = self.dequeue_pos.0.load(Ordering::Relaxed);
        tail.saturating_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue, handing the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.0.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                pos = self.enqueue_pos.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeue the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.0.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.0.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for BoundedLockFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_fifo() {
        let q = BoundedLockFreeQueue::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let q: BoundedLockFreeQueue<u32> = BoundedLockFreeQueue::new(100);
        assert_eq!(q.capacity(), 128);
    }

    #[test]
    fn test_full_queue_rejects() {
        let q = BoundedLockFreeQueue::new(4);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        assert_eq!(q.push(99), Err(99));

        assert_eq!(q.pop(), Some(0));
        q.push(4).unwrap();
    }

    #[test]
    fn test_wraparound() {
        let q = BoundedLockFreeQueue::new(4);
        for round in 0..10 {
            for i in 0..4 {
                q.push(round * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(q.pop(), Some(round * 4 + i));
            }
        }
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let q = Arc::new(BoundedLockFreeQueue::new(1024));
        let consumed = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match q.push(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        for _ in 0..2 {
            let q = q.clone();
            let consumed = consumed.clone();
            let sum = sum.clone();
            handles.push(std::thread::spawn(move || loop {
                if consumed.load(Ordering::Relaxed) >= PRODUCERS * PER_PRODUCER {
                    break;
                }
                match q.pop() {
                    Some(v) => {
                        sum.fetch_add(v, Ordering::Relaxed);
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    None => std::thread::yield_now(),
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }

    #[test]
    fn test_drop_releases_contents() {
        let q = BoundedLockFreeQueue::new(8);
        let item = Arc::new(());
        q.push(item.clone()).unwrap();
        q.push(item.clone()).unwrap();
        assert_eq!(Arc::strong_count(&item), 3);
        drop(q);
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
