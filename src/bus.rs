//! Per-request event queue between pipeline execution and the client stream
//!
//! A bounded FIFO channel with a single sequence counter. Producers publish
//! through [`EventSink`]; the transport side consumes an [`EventStream`].
//! Publishing awaits when the queue is full (backpressure instead of loss),
//! and a terminal payload (`complete`/`error`) closes the sink: any later
//! publish fails with [`ArachneError::ChannelClosed`]. Remaining events are
//! drained by the consumer before end-of-stream.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::error::{ArachneError, Result};
use crate::protocol::{EventPayload, ProtocolEvent};

/// Default queue capacity when the config does not override it
pub const DEFAULT_CAPACITY: usize = 64;

/// Create a bounded event channel with the given capacity.
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink {
        inner: Arc::new(SinkInner {
            publisher: Mutex::new(Publisher { tx, next_seq: 0 }),
            closed: AtomicBool::new(false),
        }),
    };
    let stream = EventStream {
        rx,
        _cancel_on_drop: None,
    };
    (sink, stream)
}

struct Publisher {
    tx: mpsc::Sender<ProtocolEvent>,
    next_seq: u64,
}

struct SinkInner {
    /// Sequence assignment and send happen under one lock so concurrent
    /// producers cannot interleave sequence numbers out of enqueue order.
    publisher: Mutex<Publisher>,
    closed: AtomicBool,
}

/// Producer handle: assigns sequence numbers and enforces terminal closure
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    /// Publish one payload, returning its sequence number.
    ///
    /// Awaits while the queue is full. Fails with `ChannelClosed` once a
    /// terminal event has been published or the consumer has gone away.
    pub async fn publish(&self, payload: EventPayload) -> Result<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ArachneError::ChannelClosed);
        }

        let mut publisher = self.inner.publisher.lock().await;
        // Re-check under the lock: a racing terminal publish wins cleanly.
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ArachneError::ChannelClosed);
        }

        let terminal = payload.is_terminal();
        let seq = publisher.next_seq;
        publisher
            .tx
            .send(ProtocolEvent::new(seq, payload))
            .await
            .map_err(|_| ArachneError::ChannelClosed)?;
        publisher.next_seq += 1;

        if terminal {
            self.inner.closed.store(true, Ordering::Release);
            debug!(sequence = seq, "event sink closed by terminal event");
        }
        Ok(seq)
    }

    /// Publish a terminal `error` event derived from an [`ArachneError`].
    pub async fn publish_error(&self, err: &ArachneError) -> Result<u64> {
        self.publish(EventPayload::error(err)).await
    }

    /// Publish a terminal `complete` event.
    pub async fn publish_complete(&self, url: Option<String>) -> Result<u64> {
        self.publish(EventPayload::complete(url)).await
    }

    /// Whether a terminal event has already been published.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Consumer handle yielding events in enqueue order
pub struct EventStream {
    rx: mpsc::Receiver<ProtocolEvent>,
    /// Cancels the bound pipeline run when the client stops reading
    _cancel_on_drop: Option<DropGuard>,
}

impl EventStream {
    /// Tie a cancellation guard to this stream: dropping the stream (client
    /// disconnect) cancels the associated run.
    pub fn with_cancel_guard(mut self, guard: DropGuard) -> Self {
        self._cancel_on_drop = Some(guard);
        self
    }

    /// Await the next event; `None` once the stream is drained and all
    /// producers are gone.
    pub async fn next(&mut self) -> Option<ProtocolEvent> {
        self.rx.recv().await
    }

    /// Drain the whole stream into a vector. Intended for one-shot CLI use
    /// and tests; the server consumes incrementally.
    pub async fn collect(mut self) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl tokio_stream::Stream for EventStream {
    type Item = ProtocolEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequences_are_gapless_and_ordered() {
        let (sink, mut stream) = channel(8);

        sink.publish(EventPayload::Start {}).await.unwrap();
        sink.publish(EventPayload::progress("working", 50.0))
            .await
            .unwrap();
        sink.publish_complete(None).await.unwrap();

        let mut expected = 0u64;
        while let Some(event) = stream.next().await {
            assert_eq!(event.sequence, expected);
            expected += 1;
        }
        assert_eq!(expected, 3);
    }

    #[tokio::test]
    async fn test_terminal_event_closes_sink() {
        let (sink, mut stream) = channel(8);

        sink.publish_complete(None).await.unwrap();
        assert!(sink.is_closed());

        let err = sink.publish(EventPayload::report("late")).await.unwrap_err();
        assert!(matches!(err, ArachneError::ChannelClosed));

        // The terminal event is still delivered, then end-of-stream.
        assert!(stream.next().await.unwrap().is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (sink, mut stream) = channel(1);

        sink.publish(EventPayload::Start {}).await.unwrap();

        let blocked_sink = sink.clone();
        let producer = tokio::spawn(async move {
            blocked_sink
                .publish(EventPayload::progress("queued", 10.0))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished(), "publish should wait, not drop");

        // Consuming one event unblocks the producer.
        assert_eq!(stream.next().await.unwrap().sequence, 0);
        producer.await.unwrap().unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_never_race_sequences() {
        let (sink, stream) = channel(64);

        let mut handles = Vec::new();
        for i in 0..8 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..4 {
                    sink.publish(EventPayload::progress(format!("p{i}-{j}"), 0.0))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        sink.publish_complete(None).await.unwrap();
        drop(sink);

        let events = stream.collect().await;
        assert_eq!(events.len(), 33);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64);
        }
    }
}
