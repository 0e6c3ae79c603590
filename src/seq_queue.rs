//! Sequencing priority queue.
//!
//! Upload chunks may arrive out of order from several connections or from retries. The
//! queue hands them to a single writer in ascending offset order, merging contiguous runs
//! so the writer sees gap-free, non-overlapping ranges.

use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A byte range of an upload. `is_final` marks the end of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadData {
    pub offset: u64,
    pub data_size: u64,
    pub is_final: bool,
}

impl UploadData {
    pub fn new(offset: u64, data_size: u64) -> Self {
        Self {
            offset,
            data_size,
            is_final: false,
        }
    }
}

impl Ord for UploadData {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.offset, self.is_final).cmp(&(other.offset, other.is_final))
    }
}

impl PartialOrd for UploadData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<UploadData>>,
    /// Next offset the consumer expects.
    next: u64,
    /// Terminal marker set by `done`.
    last: Option<UploadData>,
    /// Total upload size announced by `done`.
    data_size: u64,
}

#[derive(Default)]
pub struct SeqPriorityQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl SeqPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a chunk. Chunks below the consumer's watermark are dropped.
    pub fn push(&self, data: UploadData) {
        let mut state = self.state.lock();
        if data.offset < state.next {
            return;
        }
        let wake = data.offset == state.next;
        state.heap.push(Reverse(UploadData {
            is_final: false,
            ..data
        }));
        if wake {
            self.ready.notify_one();
        }
    }

    /// Marks the stream complete: `last` is the terminal marker and `data_size` the total
    /// number of bytes the upload announced.
    pub fn done(&self, last: UploadData, data_size: u64) {
        let mut state = self.state.lock();
        state.data_size = data_size;
        state.last = Some(UploadData {
            is_final: true,
            ..last
        });
        self.ready.notify_one();
    }

    /// Blocks until the next contiguous range is available and returns it.
    ///
    /// A returned item with `is_final` set ends the stream. Queued data past a gap keeps
    /// the consumer waiting even after `done`; only once nothing is left to merge is the
    /// missing tail up to the announced size returned as the final item.
    pub fn popup(&self) -> UploadData {
        let mut state = self.state.lock();
        loop {
            let next = state.next;
            while matches!(state.heap.peek(), Some(Reverse(top)) if top.offset < next) {
                state.heap.pop();
            }
            match state.heap.peek().map(|r| r.0) {
                Some(top) if top.offset == next => return Self::merge_run(&mut state),
                None => {
                    if let Some(last) = state.last {
                        return Self::finish(&mut state, last);
                    }
                }
                _ => {}
            }
            self.ready.wait(&mut state);
        }
    }

    fn merge_run(state: &mut QueueState) -> UploadData {
        let next = state.next;
        let mut end = next;
        while let Some(Reverse(item)) = state.heap.peek().copied() {
            if item.offset > end {
                break;
            }
            state.heap.pop();
            // Overlapping retries only extend the run by their new bytes.
            end = end.max(item.offset + item.data_size);
        }
        state.next = end;
        UploadData {
            offset: next,
            data_size: end - next,
            is_final: false,
        }
    }

    fn finish(state: &mut QueueState, last: UploadData) -> UploadData {
        let next = state.next;
        let data_size = if last.offset == next {
            last.data_size
        } else {
            state.data_size.saturating_sub(next)
        };
        state.next = next + data_size;
        UploadData {
            offset: next,
            data_size,
            is_final: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_out_of_order_chunks_merge() {
        let queue = SeqPriorityQueue::new();
        queue.push(UploadData::new(0, 5));
        queue.push(UploadData::new(10, 5));
        queue.push(UploadData::new(5, 5));
        queue.done(UploadData::new(15, 0), 15);

        assert_eq!(
            queue.popup(),
            UploadData {
                offset: 0,
                data_size: 15,
                is_final: false
            }
        );
        assert_eq!(
            queue.popup(),
            UploadData {
                offset: 15,
                data_size: 0,
                is_final: true
            }
        );
    }

    #[test]
    fn test_stale_push_is_dropped() {
        let queue = SeqPriorityQueue::new();
        queue.push(UploadData::new(0, 10));
        assert_eq!(queue.popup().data_size, 10);
        queue.push(UploadData::new(0, 10));
        queue.push(UploadData::new(10, 4));
        let chunk = queue.popup();
        assert_eq!((chunk.offset, chunk.data_size), (10, 4));
    }

    #[test]
    fn test_done_with_gap_returns_tail() {
        let queue = SeqPriorityQueue::new();
        queue.push(UploadData::new(0, 4));
        queue.done(UploadData::new(20, 0), 30);
        assert_eq!(queue.popup().data_size, 4);
        let tail = queue.popup();
        assert!(tail.is_final);
        assert_eq!((tail.offset, tail.data_size), (4, 26));
    }

    #[test]
    fn test_done_before_middle_chunk_waits_for_it() {
        let queue = Arc::new(SeqPriorityQueue::new());
        queue.push(UploadData::new(0, 4));
        queue.push(UploadData::new(10, 5));
        queue.done(UploadData::new(15, 0), 15);
        assert_eq!(queue.popup(), UploadData::new(0, 4));

        let late = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push(UploadData::new(4, 6));
            })
        };
        assert_eq!(queue.popup(), UploadData::new(4, 11));
        late.join().unwrap();
        assert_eq!(
            queue.popup(),
            UploadData {
                offset: 15,
                data_size: 0,
                is_final: true
            }
        );
    }

    #[test]
    fn test_concurrent_producers_are_gap_free() {
        let queue = Arc::new(SeqPriorityQueue::new());
        let total = 400u64;
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut chunks = Vec::new();
                loop {
                    let chunk = queue.popup();
                    chunks.push(chunk);
                    if chunk.is_final {
                        return chunks;
                    }
                }
            })
        };

        let producers: Vec<_> = (0..4u64)
            .map(|lane| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in (0..100u64).rev().filter(|i| i % 4 == lane) {
                        queue.push(UploadData::new(i * 4, 4));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        queue.done(UploadData::new(total, 0), total);

        let chunks = consumer.join().unwrap();
        let mut expected = 0;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected);
            expected += chunk.data_size;
        }
        assert_eq!(expected, total);
        assert!(chunks.last().unwrap().is_final);
    }
}
