//! Drop-oldest fan-out of encoded frames.
//!
//! Each source has one `FrameDistributor`. The pipeline publishes every encoded frame
//! once; the distributor copies a reference into every live viewer's own bounded
//! queue. A full queue loses its oldest frame, never blocks the publisher, and never
//! affects other viewers, so N viewers each see the full frame rate.
//!
//! The distributor also retains the last few frames itself so a fresh viewer starts
//! with the latest picture instead of waiting for the next publish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::frame::EncodedFrame;

/// Frames buffered per viewer (and retained by the distributor).
pub const DEFAULT_BUFFER_FRAMES: usize = 5;

#[derive(Debug)]
pub struct FrameDistributor {
    capacity: usize,
    shared: Mutex<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    recent: VecDeque<EncodedFrame>,
    viewers: Vec<Weak<ViewerQueue>>,
    next_sequence: u64,
}

#[derive(Debug)]
struct ViewerQueue {
    frames: Mutex<VecDeque<EncodedFrame>>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl ViewerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: EncodedFrame, capacity: usize) {
        let mut frames = lock(&self.frames);
        while frames.len() >= capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        drop(frames);
        self.ready.notify_all();
    }
}

impl FrameDistributor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            shared: Mutex::new(Shared::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish one frame to every live viewer. Never blocks on a consumer.
    /// Returns the sequence number assigned to the frame.
    pub fn publish(&self, frame: EncodedFrame) -> u64 {
        let mut shared = lock(&self.shared);
        shared.next_sequence += 1;
        let sequence = shared.next_sequence;
        let frame = frame.with_sequence(sequence);

        while shared.recent.len() >= self.capacity {
            shared.recent.pop_front();
        }
        shared.recent.push_back(frame.clone());

        let capacity = self.capacity;
        shared.viewers.retain(|viewer| match viewer.upgrade() {
            Some(queue) => {
                queue.push(frame.clone(), capacity);
                true
            }
            None => false,
        });
        sequence
    }

    /// Register a new viewer. Its queue starts with the latest retained frame, if any.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(ViewerQueue::new(self.capacity));
        let mut shared = lock(&self.shared);
        if let Some(latest) = shared.recent.back() {
            queue.push(latest.clone(), self.capacity);
        }
        shared.viewers.push(Arc::downgrade(&queue));
        Subscription {
            queue,
            capacity: self.capacity,
        }
    }

    /// Frames currently retained by the distributor (at most `capacity`).
    pub fn len(&self) -> usize {
        lock(&self.shared).recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<EncodedFrame> {
        lock(&self.shared).recent.back().cloned()
    }

    /// Retained frames, oldest first.
    pub fn retained(&self) -> Vec<EncodedFrame> {
        lock(&self.shared).recent.iter().cloned().collect()
    }

    pub fn published(&self) -> u64 {
        lock(&self.shared).next_sequence
    }

    /// Number of viewers still subscribed.
    pub fn viewer_count(&self) -> usize {
        let mut shared = lock(&self.shared);
        shared.viewers.retain(|viewer| viewer.strong_count() > 0);
        shared.viewers.len()
    }
}

impl Default for FrameDistributor {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

/// One viewer's cursor into a distributor. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<ViewerQueue>,
    capacity: usize,
}

impl Subscription {
    /// Wait up to `timeout` for the next frame. `None` means the wait timed out.
    pub fn take(&self, timeout: Duration) -> Option<EncodedFrame> {
        let frames = lock(&self.queue.frames);
        let (mut frames, _) = self
            .queue
            .ready
            .wait_timeout_while(frames, timeout, |frames| frames.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        frames.pop_front()
    }

    pub fn try_take(&self) -> Option<EncodedFrame> {
        lock(&self.queue.frames).pop_front()
    }

    /// Frames waiting in this viewer's queue.
    pub fn buffered(&self) -> usize {
        lock(&self.queue.frames).len()
    }

    /// Frames evicted from this viewer's queue because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn frame(tag: u8) -> EncodedFrame {
        EncodedFrame::new(vec![0xFF, 0xD8, tag])
    }

    fn tag(frame: &EncodedFrame) -> u8 {
        frame.bytes()[2]
    }

    #[test]
    fn retains_latest_five_without_viewers() {
        let distributor = FrameDistributor::default();
        for i in 1..=6 {
            distributor.publish(frame(i));
        }
        assert_eq!(distributor.len(), 5);
        let tags: Vec<u8> = distributor.retained().iter().map(tag).collect();
        assert_eq!(tags, vec![2, 3, 4, 5, 6]);
        assert_eq!(distributor.published(), 6);
    }

    #[test]
    fn slow_viewer_loses_oldest_frames() {
        let distributor = FrameDistributor::default();
        let viewer = distributor.subscribe();
        for i in 1..=8 {
            distributor.publish(frame(i));
            assert!(viewer.buffered() <= 5);
        }
        assert_eq!(viewer.dropped(), 3);
        let mut seen = Vec::new();
        while let Some(f) = viewer.try_take() {
            seen.push(tag(&f));
        }
        assert_eq!(seen, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn every_viewer_sees_every_frame() {
        let distributor = FrameDistributor::default();
        let a = distributor.subscribe();
        let b = distributor.subscribe();
        for i in 1..=3 {
            distributor.publish(frame(i));
        }
        for viewer in [&a, &b] {
            let seen: Vec<u8> = std::iter::from_fn(|| viewer.try_take())
                .map(|f| tag(&f))
                .collect();
            assert_eq!(seen, vec![1, 2, 3]);
        }
    }

    #[test]
    fn new_viewer_starts_with_latest_frame() {
        let distributor = FrameDistributor::default();
        distributor.publish(frame(1));
        distributor.publish(frame(2));
        let viewer = distributor.subscribe();
        let first = viewer.try_take().expect("seeded frame");
        assert_eq!(tag(&first), 2);
        assert_eq!(first.sequence, 2);
        assert!(viewer.try_take().is_none());
    }

    #[test]
    fn take_times_out_when_starved() {
        let distributor = FrameDistributor::default();
        let viewer = distributor.subscribe();
        let started = Instant::now();
        assert!(viewer.take(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dropped_viewers_are_pruned() {
        let distributor = FrameDistributor::default();
        let keep = distributor.subscribe();
        {
            let _gone = distributor.subscribe();
            assert_eq!(distributor.viewer_count(), 2);
        }
        distributor.publish(frame(1));
        assert_eq!(distributor.viewer_count(), 1);
        assert_eq!(keep.buffered(), 1);
    }

    #[test]
    fn concurrent_viewers_receive_in_order() {
        let distributor = Arc::new(FrameDistributor::default());
        let viewers: Vec<Subscription> = (0..3).map(|_| distributor.subscribe()).collect();

        let consumers: Vec<_> = viewers
            .into_iter()
            .map(|viewer| {
                thread::spawn(move || {
                    let mut sequences = Vec::new();
                    while let Some(f) = viewer.take(Duration::from_millis(200)) {
                        assert!(viewer.buffered() <= viewer.capacity());
                        sequences.push(f.sequence);
                    }
                    sequences
                })
            })
            .collect();

        let producer = {
            let distributor = distributor.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    distributor.publish(frame((i % 256) as u8));
                    if i % 20 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };
        producer.join().expect("producer");

        for consumer in consumers {
            let sequences = consumer.join().expect("consumer");
            assert!(!sequences.is_empty());
            assert!(sequences.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(sequences.last().copied(), Some(200));
        }
        assert!(distributor.len() <= 5);
    }
}
