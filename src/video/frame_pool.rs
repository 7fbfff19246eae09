//! Fixed set of reusable compressed-frame buffers.
//!
//! Every slot is always in exactly one place: the empty FIFO, the ready FIFO,
//! or checked out as a [`Frame`] by one thread. Each FIFO has its own mutex
//! and every transition happens under one of them, so a snapshot taken while
//! holding both is consistent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::error::{AppError, Result};

/// Storage of one slot
#[derive(Debug)]
struct FrameSlot {
    data: Box<[u8]>,
    length: usize,
}

/// Counts of slots per state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub empty: usize,
    pub ready: usize,
    pub checked_out: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.empty + self.ready + self.checked_out
    }
}

/// A slot checked out of the pool.
///
/// Hand it back with [`FramePool::recycle`]; dropping it returns it to the
/// empty queue.
pub struct Frame<'a> {
    pool: &'a FramePool,
    index: usize,
    slot: Option<MutexGuard<'a, FrameSlot>>,
}

impl Frame<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.data.len())
    }

    pub fn len(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Valid bytes
    pub fn data(&self) -> &[u8] {
        match &self.slot {
            Some(s) => &s.data[..s.length],
            None => &[],
        }
    }

    /// Set the valid length to `len` and return the writable region
    pub fn fill(&mut self, len: usize) -> Result<&mut [u8]> {
        let slot = self
            .slot
            .as_mut()
            .ok_or_else(|| AppError::Protocol("frame already recycled".into()))?;
        if len > slot.data.len() {
            return Err(AppError::Protocol(format!(
                "frame of {} bytes exceeds slot capacity {}",
                len,
                slot.data.len()
            )));
        }
        slot.length = len;
        Ok(&mut slot.data[..len])
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if self.slot.take().is_some() {
            self.pool.push_empty(self.index);
        }
    }
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

/// Arena of `N` frame slots with index-based empty and ready FIFOs
#[derive(Debug)]
pub struct FramePool {
    slots: Box<[Mutex<FrameSlot>]>,
    empty: Mutex<VecDeque<usize>>,
    ready: Mutex<VecDeque<usize>>,
    checked_out: AtomicUsize,
    buffer_limit: AtomicUsize,
}

impl FramePool {
    /// Allocate `count` slots of `capacity` bytes, all empty
    pub fn new(count: usize, capacity: usize, buffer_limit: usize) -> Self {
        let slots = (0..count)
            .map(|_| {
                Mutex::new(FrameSlot {
                    data: vec![0u8; capacity].into_boxed_slice(),
                    length: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            empty: Mutex::new((0..count).collect()),
            ready: Mutex::new(VecDeque::with_capacity(count)),
            checked_out: AtomicUsize::new(0),
            buffer_limit: AtomicUsize::new(buffer_limit),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit.load(Ordering::Relaxed)
    }

    pub fn set_buffer_limit(&self, limit: usize) {
        self.buffer_limit.store(limit, Ordering::Relaxed);
    }

    fn check_out(&self, index: usize) -> Frame<'_> {
        Frame {
            pool: self,
            index,
            slot: Some(self.slots[index].lock()),
        }
    }

    /// Pop an empty slot, or `None` when all slots are queued or in use
    pub fn take_empty(&self) -> Option<Frame<'_>> {
        let index = {
            let mut empty = self.empty.lock();
            let index = empty.pop_front()?;
            self.checked_out.fetch_add(1, Ordering::AcqRel);
            index
        };
        Some(self.check_out(index))
    }

    /// Pop the oldest ready frame, only when more than `backlog_limit` are queued
    pub fn take_ready(&self, backlog_limit: usize) -> Option<Frame<'_>> {
        let index = {
            let mut ready = self.ready.lock();
            if ready.len() <= backlog_limit {
                return None;
            }
            let index = ready.pop_front()?;
            self.checked_out.fetch_add(1, Ordering::AcqRel);
            index
        };
        Some(self.check_out(index))
    }

    /// Return a checked-out frame.
    ///
    /// With `to_ready`, the frame is queued for decoding only while the ready
    /// queue holds at most `buffer_limit` frames; otherwise it is dropped back
    /// to the empty queue unread.
    pub fn recycle(&self, mut frame: Frame<'_>, to_ready: bool) {
        // unlock the slot before its index becomes visible to other threads
        drop(frame.slot.take());
        let index = frame.index;

        if to_ready {
            let mut ready = self.ready.lock();
            if ready.len() <= self.buffer_limit() {
                ready.push_back(index);
                self.checked_out.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            trace!("Ready queue full, dropping frame {}", index);
        }
        self.push_empty(index);
    }

    fn push_empty(&self, index: usize) {
        let mut empty = self.empty.lock();
        if let Some(slot) = self.slots.get(index) {
            // the slot is unlocked at this point and owned by nobody else
            if let Some(mut s) = slot.try_lock() {
                s.length = 0;
            }
        }
        empty.push_back(index);
        self.checked_out.fetch_sub(1, Ordering::AcqRel);
    }

    /// Consistent per-state counts
    pub fn stats(&self) -> PoolStats {
        let empty = self.empty.lock();
        let ready = self.ready.lock();
        PoolStats {
            empty: empty.len(),
            ready: ready.len(),
            checked_out: self.checked_out.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn assert_conserved(pool: &FramePool) {
        let stats = pool.stats();
        assert_eq!(stats.total(), pool.size(), "{:?}", stats);
    }

    #[test]
    fn test_take_and_recycle() {
        let pool = FramePool::new(3, 16, 0);
        assert_eq!(
            pool.stats(),
            PoolStats {
                empty: 3,
                ready: 0,
                checked_out: 0
            }
        );

        let mut frame = pool.take_empty().unwrap();
        frame.fill(4).unwrap().copy_from_slice(b"jpeg");
        assert_eq!(pool.stats().checked_out, 1);
        assert_conserved(&pool);

        pool.recycle(frame, true);
        assert_eq!(pool.stats().ready, 1);

        let frame = pool.take_ready(0).unwrap();
        assert_eq!(frame.data(), b"jpeg");
        assert_conserved(&pool);
        pool.recycle(frame, false);
        assert_eq!(pool.stats().empty, 3);
    }

    #[test]
    fn test_take_empty_exhausts() {
        let pool = FramePool::new(2, 8, 0);
        let a = pool.take_empty().unwrap();
        let b = pool.take_empty().unwrap();
        assert!(pool.take_empty().is_none());
        assert_conserved(&pool);
        drop(a);
        assert!(pool.take_empty().is_some());
        drop(b);
        assert_eq!(pool.stats().empty, 2);
    }

    #[test]
    fn test_take_ready_respects_backlog_limit() {
        let pool = FramePool::new(4, 8, 3);
        for _ in 0..2 {
            let f = pool.take_empty().unwrap();
            pool.recycle(f, true);
        }
        assert!(pool.take_ready(2).is_none());
        assert!(pool.take_ready(1).is_some());
        assert_conserved(&pool);
    }

    #[test]
    fn test_fill_rejects_oversized_frame() {
        let pool = FramePool::new(2, 8, 0);
        let mut frame = pool.take_empty().unwrap();
        assert!(matches!(frame.fill(9), Err(AppError::Protocol(_))));
        assert_eq!(frame.fill(8).unwrap().len(), 8);
    }

    #[test]
    fn test_freshest_frame_wins() {
        let pool = FramePool::new(3, 8, 0);

        // the decoder never consumes: only the first produced frame is kept
        for i in 0..10u8 {
            let mut frame = pool.take_empty().expect("producer never starves");
            frame.fill(1).unwrap()[0] = i;
            pool.recycle(frame, true);

            let stats = pool.stats();
            assert!(stats.ready <= 1, "{:?}", stats);
            assert_eq!(stats.total(), 3);
        }

        let frame = pool.take_ready(0).unwrap();
        assert_eq!(frame.data(), &[0]);
        pool.recycle(frame, false);
        assert!(pool.take_ready(0).is_none());
    }

    #[test]
    fn test_buffer_limit_is_adjustable() {
        let pool = FramePool::new(4, 8, 0);
        pool.set_buffer_limit(1);
        for _ in 0..3 {
            let f = pool.take_empty().unwrap();
            pool.recycle(f, true);
        }
        assert_eq!(pool.stats().ready, 2);
    }

    #[test]
    fn test_conservation_under_concurrency() {
        let pool = Arc::new(FramePool::new(3, 32, 0));
        let running = Arc::new(AtomicBool::new(true));

        let producer = {
            let pool = pool.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let mut produced = 0u32;
                while running.load(Ordering::Relaxed) {
                    match pool.take_empty() {
                        Some(mut frame) => {
                            frame.fill(4).unwrap().copy_from_slice(&produced.to_le_bytes());
                            pool.recycle(frame, true);
                            produced += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            })
        };

        let consumer = {
            let pool = pool.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let mut last = None;
                while running.load(Ordering::Relaxed) {
                    if let Some(frame) = pool.take_ready(0) {
                        let seq = u32::from_le_bytes(frame.data().try_into().unwrap());
                        // skipping is allowed, reordering is not
                        assert!(last.map_or(true, |l| seq > l));
                        last = Some(seq);
                        pool.recycle(frame, false);
                    }
                }
            })
        };

        for _ in 0..200 {
            assert_conserved(&pool);
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        running.store(false, Ordering::Relaxed);
        producer.join().unwrap();
        consumer.join().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.total(), 3);
    }
}
