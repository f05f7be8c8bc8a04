//! Ring-buffer frame ingestion: validation, callback fan-out, and the
//! bounded pull queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kernwatch_common::{Event, EVENT_SIZE};
use tracing::warn;

/// Pull-queue capacity; the oldest event is discarded once full.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Callback invoked on the drainer thread for every accepted frame, before
/// the frame is enqueued. It runs between ring drains and must not block;
/// a stalled callback stalls consumption for every CPU's events.
pub type EventCallback = Box<dyn FnMut(&Event) + Send>;

/// Drop/throughput counters. Drops are never fatal, only accounted.
#[derive(Debug, Default)]
pub struct SinkCounters {
    /// Frames accepted and delivered.
    pub total_events: AtomicU64,
    /// Frames smaller than the event layout, dropped at validation.
    pub short_frames: AtomicU64,
    /// Events discarded from the head of the full pull queue.
    pub queue_drops: AtomicU64,
}

/// Receives raw ring frames and fans them out to the callback and queue.
pub struct EventSink {
    callback: Mutex<Option<EventCallback>>,
    queue: Mutex<VecDeque<Event>>,
    counters: SinkCounters,
}

impl EventSink {
    pub fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            queue: Mutex::new(VecDeque::with_capacity(1024)),
            counters: SinkCounters::default(),
        }
    }

    /// Replace (or clear) the event callback.
    pub fn set_callback(&self, callback: Option<EventCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    /// Ingest one raw frame from the ring buffer.
    ///
    /// Short frames are counted and dropped. Valid frames reach the
    /// callback first, then the queue, so callback consumers see every
    /// frame the sink accepts even while the queue is shedding its head.
    pub fn ingest(&self, frame: &[u8]) {
        let Some(event) = Event::from_bytes(frame) else {
            self.counters.short_frames.fetch_add(1, Ordering::Relaxed);
            warn!(len = frame.len(), expected = EVENT_SIZE, "dropping undersized ring frame");
            return;
        };

        self.counters.total_events.fetch_add(1, Ordering::Relaxed);

        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(&event);
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= EVENT_QUEUE_CAPACITY {
            queue.pop_front();
            self.counters.queue_drops.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
    }

    /// Pop the oldest queued event. Non-blocking.
    pub fn pop(&self) -> Option<Event> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Pop up to `max` events in arrival order. Non-blocking.
    pub fn pop_many(&self, max: usize) -> Vec<Event> {
        let mut queue = self.queue.lock().unwrap();
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn counters(&self) -> &SinkCounters {
        &self.counters
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn frame_with_pid(pid: u32) -> Vec<u8> {
        let mut event = Event::zeroed();
        event.pid = pid;
        let bytes = unsafe {
            std::slice::from_raw_parts((&event as *const Event).cast::<u8>(), EVENT_SIZE)
        };
        bytes.to_vec()
    }

    #[test]
    fn test_short_frame_is_counted_and_dropped() {
        let sink = EventSink::new();
        sink.ingest(&[0u8; EVENT_SIZE - 4]);
        assert_eq!(sink.depth(), 0);
        assert_eq!(sink.counters().short_frames.load(Ordering::Relaxed), 1);
        assert_eq!(sink.counters().total_events.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pop_returns_events_in_arrival_order() {
        let sink = EventSink::new();
        for pid in 1..=3 {
            sink.ingest(&frame_with_pid(pid));
        }
        assert_eq!(sink.pop().map(|e| e.pid), Some(1));
        assert_eq!(sink.pop().map(|e| e.pid), Some(2));
        assert_eq!(sink.pop().map(|e| e.pid), Some(3));
        assert!(sink.pop().is_none());
    }

    #[test]
    fn test_pop_many_caps_at_queue_depth() {
        let sink = EventSink::new();
        for pid in 1..=5 {
            sink.ingest(&frame_with_pid(pid));
        }
        let events = sink.pop_many(3);
        assert_eq!(events.iter().map(|e| { e.pid }).collect::<Vec<_>>(), vec![1, 2, 3]);
        let rest = sink.pop_many(100);
        assert_eq!(rest.len(), 2);
        assert!(sink.pop_many(10).is_empty());
    }

    #[test]
    fn test_overflow_drops_head_and_keeps_newest() {
        let sink = EventSink::new();
        for pid in 0..(EVENT_QUEUE_CAPACITY as u32 + 100) {
            sink.ingest(&frame_with_pid(pid));
        }
        assert_eq!(sink.depth(), EVENT_QUEUE_CAPACITY);
        assert_eq!(sink.counters().queue_drops.load(Ordering::Relaxed), 100);
        // The first 100 events are gone; the survivors are in order.
        assert_eq!(sink.pop().map(|e| e.pid), Some(100));
        assert_eq!(sink.pop().map(|e| e.pid), Some(101));
    }

    #[test]
    fn test_callback_sees_frames_the_queue_sheds() {
        let sink = EventSink::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        sink.set_callback(Some(Box::new(move |_event| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        let total = EVENT_QUEUE_CAPACITY + 50;
        for pid in 0..total as u32 {
            sink.ingest(&frame_with_pid(pid));
        }
        assert_eq!(seen.load(Ordering::Relaxed), total);
        assert_eq!(sink.depth(), EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_callback_can_be_cleared() {
        let sink = EventSink::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        sink.set_callback(Some(Box::new(move |_event| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));
        sink.ingest(&frame_with_pid(1));
        sink.set_callback(None);
        sink.ingest(&frame_with_pid(2));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert_eq!(sink.depth(), 2);
    }
}
