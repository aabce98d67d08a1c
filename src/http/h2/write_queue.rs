//! Priority-ordered queue of outbound frames.
//!
//! One FIFO per [`RequestPriority`]; dequeue always takes from the most
//! urgent non-empty FIFO. Entries remember the stream that queued them so
//! a closing stream can purge what it left behind.

use super::frames::{FrameType, HeaderList};
use super::priority::RequestPriority;
use super::stream::{StreamId, StreamKey};
use bytes::Bytes;
use std::collections::VecDeque;

/// Produces the bytes of a queued frame
#[derive(Debug, Clone)]
pub enum FrameProducer {
    /// Already serialized control frame(s)
    Serialized(Bytes),
    /// Serialized DATA frame; `payload_len` bytes were charged to the send
    /// windows when it was framed
    Data { frame: Bytes, payload_len: usize },
    /// Request HEADERS, HPACK-encoded when dequeued so that header blocks
    /// hit the wire in the order they were compressed
    Headers { headers: HeaderList, end_stream: bool },
}

impl FrameProducer {
    /// Send-window bytes to hand back if this write is dropped unsent
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            FrameProducer::Data { payload_len, .. } => *payload_len,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct WriteQueueEntry {
    pub frame_type: FrameType,
    pub producer: FrameProducer,
    /// Owning stream, `None` for session-level frames
    pub stream: Option<StreamKey>,
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    queues: [VecDeque<WriteQueueEntry>; RequestPriority::COUNT],
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn enqueue(
        &mut self,
        priority: RequestPriority,
        frame_type: FrameType,
        producer: FrameProducer,
        stream: Option<StreamKey>,
    ) {
        self.queues[priority.index()].push_back(WriteQueueEntry {
            frame_type,
            producer,
            stream,
        });
    }

    /// Next entry, most urgent priority first
    pub fn dequeue(&mut self) -> Option<WriteQueueEntry> {
        RequestPriority::HIGHEST_FIRST
            .iter()
            .find_map(|priority| self.queues[priority.index()].pop_front())
    }

    /// Remove every entry queued by `stream`
    pub fn remove_pending_writes_for_stream(&mut self, stream: StreamKey) -> Vec<WriteQueueEntry> {
        self.remove_where(|entry| entry.stream == Some(stream))
    }

    /// Remove entries of streams the peer will never process: those with
    /// no id yet, or an id above `last_good_stream_id`. `stream_id` maps a
    /// key to its current wire id, `None` if the stream is gone.
    pub fn remove_pending_writes_for_streams_after(
        &mut self,
        last_good_stream_id: StreamId,
        stream_id: impl Fn(StreamKey) -> Option<StreamId>,
    ) -> Vec<WriteQueueEntry> {
        self.remove_where(|entry| match entry.stream {
            Some(key) => match stream_id(key) {
                Some(id) => id == 0 || id > last_good_stream_id,
                None => true,
            },
            None => false,
        })
    }

    /// Move a stream's queued writes to a new priority, keeping their order
    pub fn change_priority_of_writes_for_stream(
        &mut self,
        stream: StreamKey,
        old_priority: RequestPriority,
        new_priority: RequestPriority,
    ) {
        if old_priority == new_priority {
            return;
        }
        let old = &mut self.queues[old_priority.index()];
        let mut moved = Vec::new();
        let mut kept = VecDeque::with_capacity(old.len());
        for entry in old.drain(..) {
            if entry.stream == Some(stream) {
                moved.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *old = kept;
        self.queues[new_priority.index()].extend(moved);
    }

    /// Remove everything
    pub fn clear(&mut self) -> Vec<WriteQueueEntry> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&WriteQueueEntry) -> bool) -> Vec<WriteQueueEntry> {
        let mut removed = Vec::new();
        for queue in self.queues.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if pred(&entry) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(tag: &'static str) -> FrameProducer {
        FrameProducer::Serialized(Bytes::from_static(tag.as_bytes()))
    }

    fn tag(entry: &WriteQueueEntry) -> Bytes {
        match &entry.producer {
            FrameProducer::Serialized(b) => b.clone(),
            FrameProducer::Data { frame, .. } => frame.clone(),
            FrameProducer::Headers { .. } => Bytes::from_static(b"headers"),
        }
    }

    #[test]
    fn test_dequeue_priority_then_fifo() {
        let mut queue = WriteQueue::new();
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("low-1"), None);
        queue.enqueue(RequestPriority::Highest, FrameType::Ping, control("ping"), None);
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("low-2"), None);
        queue.enqueue(RequestPriority::Medium, FrameType::Data, control("medium"), None);
        assert_eq!(queue.len(), 4);

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|e| tag(&e)).collect();
        assert_eq!(order, vec!["ping", "medium", "low-1", "low-2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_pending_writes_for_stream() {
        let mut queue = WriteQueue::new();
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("a"), Some(StreamKey(1)));
        queue.enqueue(RequestPriority::Highest, FrameType::RstStream, control("b"), None);
        queue.enqueue(RequestPriority::Idle, FrameType::Data, control("c"), Some(StreamKey(1)));
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("d"), Some(StreamKey(2)));

        let removed = queue.remove_pending_writes_for_stream(StreamKey(1));
        assert_eq!(removed.len(), 2);
        assert!(queue.remove_pending_writes_for_stream(StreamKey(1)).is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_pending_writes_for_streams_after() {
        let mut queue = WriteQueue::new();
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("one"), Some(StreamKey(1)));
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("five"), Some(StreamKey(5)));
        queue.enqueue(RequestPriority::Low, FrameType::Headers, control("new"), Some(StreamKey(9)));
        queue.enqueue(RequestPriority::Highest, FrameType::Settings, control("settings"), None);

        let ids = |key: StreamKey| match key.0 {
            1 => Some(1),
            5 => Some(5),
            9 => Some(0),
            _ => None,
        };
        let removed = queue.remove_pending_writes_for_streams_after(3, ids);
        let removed: Vec<_> = removed.iter().map(tag).collect();
        assert_eq!(removed, vec!["five", "new"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_change_priority_keeps_order() {
        let mut queue = WriteQueue::new();
        let key = Some(StreamKey(3));
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("x1"), key);
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("other"), Some(StreamKey(4)));
        queue.enqueue(RequestPriority::Low, FrameType::Data, control("x2"), key);

        queue.change_priority_of_writes_for_stream(StreamKey(3), RequestPriority::Low, RequestPriority::Highest);
        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue()).map(|e| tag(&e)).collect();
        assert_eq!(order, vec!["x1", "x2", "other"]);
    }

    #[test]
    fn test_discarded_data_len() {
        let producer = FrameProducer::Data {
            frame: Bytes::from_static(b"frame"),
            payload_len: 42,
        };
        assert_eq!(producer.flow_controlled_len(), 42);
        assert_eq!(control("x").flow_controlled_len(), 0);
    }
}
