//! Canonical event stream between the model bridge and the collector.
//!
//! The queue holds at most [`STREAM_QUEUE_CAPACITY`] events; on overflow the
//! oldest event is dropped so a runaway stream cannot exhaust memory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::error::UicpErr;

pub const STREAM_QUEUE_CAPACITY: usize = 2000;

/// Logical stream sub-band carried on `content` events. Unknown roles map to
/// no channel at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Analysis,
    Commentary,
    Final,
    Json,
    Text,
}

impl Channel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "analysis" => Some(Channel::Analysis),
            "commentary" => Some(Channel::Commentary),
            "final" => Some(Channel::Final),
            "json" => Some(Channel::Json),
            "text" => Some(Channel::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Analysis => "analysis",
            Channel::Commentary => "commentary",
            Channel::Final => "final",
            Channel::Json => "json",
            Channel::Text => "text",
        }
    }
}

/// Discriminated union of everything a provider stream can yield once
/// normalized. Produced lazily; a stream is finite and non-restartable.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content {
        channel: Option<Channel>,
        text: String,
    },
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
        is_delta: bool,
    },
    Return {
        channel: Option<Channel>,
        name: Option<String>,
        result: Value,
    },
    Done,
}

struct QueueState {
    items: VecDeque<Result<StreamEvent>>,
    closed: bool,
    dropped: u64,
}

struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, item: Result<StreamEvent>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.closed {
            return;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
            if state.dropped == 1 || state.dropped % 100 == 0 {
                warn!(dropped = state.dropped, "stream queue overflow, dropping oldest");
            }
        }
        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Result<StreamEvent>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(item) = state.items.pop_front() {
                    // Wake the next waiter in case more items are queued.
                    if !state.items.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Producer half handed to the bridge. Dropping it without calling
/// [`EventSink::finish`] closes the stream as-is.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn event(&self, event: StreamEvent) {
        self.queue.push(Ok(event));
    }

    /// Terminal failure: the error surfaces to the consumer, then the queue
    /// closes.
    pub fn fail(&self, err: UicpErr) {
        self.queue.push(Err(err));
        self.queue.close();
    }

    pub fn finish(&self) {
        self.queue.push(Ok(StreamEvent::Done));
        self.queue.close();
    }

    /// True once the consumer has called [`EventStream::ret`] (or dropped the
    /// stream). Producers should stop pumping and cancel upstream work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Consumer half. `ret` mirrors calling an async iterator's `return()`: it
/// signals the producer to tear down its upstream listener.
pub struct EventStream {
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        self.queue.pop().await
    }

    pub fn ret(&self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.ret();
    }
}

pub fn event_channel() -> (EventSink, EventStream) {
    event_channel_with_capacity(STREAM_QUEUE_CAPACITY)
}

pub fn event_channel_with_capacity(capacity: usize) -> (EventSink, EventStream) {
    let queue = Arc::new(EventQueue::new(capacity));
    let cancel = CancellationToken::new();
    (
        EventSink {
            queue: Arc::clone(&queue),
            cancel: cancel.clone(),
        },
        EventStream { queue, cancel },
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut stream) = event_channel();
        sink.event(StreamEvent::Content {
            channel: None,
            text: "a".into(),
        });
        sink.finish();
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamEvent::Content {
                channel: None,
                text: "a".into()
            }
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamEvent::Done);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (sink, mut stream) = event_channel_with_capacity(2);
        for i in 0..4 {
            sink.event(StreamEvent::Content {
                channel: None,
                text: i.to_string(),
            });
        }
        sink.finish();
        // Capacity 2: events 0 and 1 dropped, then Done evicted event 2.
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamEvent::Content {
                channel: None,
                text: "3".into()
            }
        );
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamEvent::Done);
    }

    #[tokio::test]
    async fn ret_signals_producer() {
        let (sink, stream) = event_channel();
        assert!(!sink.is_cancelled());
        stream.ret();
        assert!(sink.is_cancelled());
    }

    #[tokio::test]
    async fn failure_surfaces_then_closes() {
        let (sink, mut stream) = event_channel();
        sink.fail(UicpErr::StreamClosed("backend hung up".into()));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some("E-UICP-1222"));
        assert!(stream.next().await.is_none());
    }
}
