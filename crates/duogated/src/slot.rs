//! Capacity-1 hand-off between the acquisition loop and the worker.
//!
//! The producer never blocks: inserting into an occupied slot evicts the
//! pending task, so the worker always sees the freshest frame instead of a
//! backlog.

use duogate_hw::{Frame, Roi};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One unit of verification work.
#[derive(Debug, Clone)]
pub struct FrameTask {
    pub frame: Frame,
    pub roi: Roi,
    pub timestamp: Instant,
}

#[derive(Default)]
pub struct TaskSlot {
    slot: Mutex<Option<FrameTask>>,
    ready: Condvar,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task`, evicting any pending one. Returns true on eviction.
    pub fn offer(&self, task: FrameTask) -> bool {
        let evicted = self.slot.lock().replace(task).is_some();
        self.ready.notify_one();
        evicted
    }

    /// Take the pending task, waiting up to `wait` for one to arrive.
    pub fn take_timeout(&self, wait: Duration) -> Option<FrameTask> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            let _ = self.ready.wait_for(&mut slot, wait);
        }
        slot.take()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(seq: u32) -> FrameTask {
        FrameTask {
            frame: Frame::new(vec![0u8; 4], 2, 2, seq),
            roi: Roi { x: 0, y: 1, width: 1, height: 1 },
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_burst_keeps_only_latest() {
        let slot = TaskSlot::new();
        assert!(!slot.offer(task(0)));
        for seq in 1..100 {
            assert!(slot.offer(task(seq)), "every further offer evicts");
        }

        let taken = slot.take_timeout(Duration::ZERO).unwrap();
        assert_eq!(taken.frame.sequence, 99);
        assert!(!slot.is_occupied());
        assert!(slot.take_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_take_times_out_when_empty() {
        let slot = TaskSlot::new();
        let started = Instant::now();
        assert!(slot.take_timeout(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_take_wakes_on_offer() {
        let slot = Arc::new(TaskSlot::new());
        let consumer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.take_timeout(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        slot.offer(task(42));
        let taken = consumer.join().unwrap().expect("consumer should receive the task");
        assert_eq!(taken.frame.sequence, 42);
    }

    #[test]
    fn test_clear() {
        let slot = TaskSlot::new();
        slot.offer(task(1));
        slot.clear();
        assert!(!slot.is_occupied());
    }
}
