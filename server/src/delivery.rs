//! Outbound frame queue drained by a single periodic task
//!
//! Handlers never write to a socket. They append frames to the
//! [`DeliveryQueue`] from whichever worker thread they run on, and one drain
//! task pops at most one frame per tick and performs the actual send or close
//! through a [`Transport`]. This keeps a single writer for every connection,
//! and the global enqueue order is the order of delivery attempts.
//!
//! A close request is just another frame in the queue, so frames pushed to a
//! connection before its close request always reach the transport first.

use crate::error::{DeliveryError, TransportError};
use crate::registry::ConnectionId;
use log::{error, trace};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Write side of the connections, implemented by the network layer
pub trait Transport: Send + Sync {
    /// Whether the connection can still be written to
    fn is_open(&self, connection: ConnectionId) -> bool;

    /// Writes one text frame
    fn send(
        &self,
        connection: ConnectionId,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Gracefully closes the connection
    fn close(
        &self,
        connection: ConnectionId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// What to do with a connection once the frame reaches the head of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Close,
}

/// A unit of outbound work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub connection: ConnectionId,
    pub payload: Payload,
}

/// Result of one successful drain tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent(ConnectionId),
    Closed(ConnectionId),
    /// The connection was already gone; the frame was dropped
    Discarded(ConnectionId),
}

/// Process-wide FIFO of outbound frames
#[derive(Default)]
pub struct DeliveryQueue {
    frames: Mutex<VecDeque<OutboundFrame>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text frame for the connection
    pub fn enqueue(&self, connection: ConnectionId, text: impl Into<String>) {
        self.push(OutboundFrame {
            connection,
            payload: Payload::Text(text.into()),
        });
    }

    /// Appends a close request for the connection
    pub fn enqueue_close(&self, connection: ConnectionId) {
        self.push(OutboundFrame {
            connection,
            payload: Payload::Close,
        });
    }

    pub fn push(&self, frame: OutboundFrame) {
        self.frames.lock().push_back(frame);
    }

    /// Removes the frame at the head of the queue
    pub fn pop(&self) -> Option<OutboundFrame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Performs one drain step
    ///
    /// Pops at most one frame. Frames for connections that are no longer
    /// open are discarded silently. A transport failure abandons the frame
    /// and is returned to the caller; it is never retried, since a retry
    /// would reorder the queue.
    pub async fn drain_once<T: Transport>(
        &self,
        transport: &T,
    ) -> Result<Option<Delivery>, DeliveryError> {
        let Some(frame) = self.pop() else {
            return Ok(None);
        };
        let connection = frame.connection;

        if !transport.is_open(connection) {
            trace!("discarding frame for closed {}", connection);
            return Ok(Some(Delivery::Discarded(connection)));
        }

        let result = match frame.payload {
            Payload::Text(text) => transport
                .send(connection, text)
                .await
                .map(|_| Delivery::Sent(connection)),
            Payload::Close => transport
                .close(connection)
                .await
                .map(|_| Delivery::Closed(connection)),
        };

        result
            .map(Some)
            .map_err(|source| DeliveryError { connection, source })
    }

    /// Drains the queue forever, one frame per tick
    pub async fn run<T: Transport>(self: Arc<Self>, transport: Arc<T>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.drain_once(transport.as_ref()).await {
                error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Records every transport call instead of touching a socket
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub open: Mutex<HashSet<ConnectionId>>,
        pub failing: Mutex<HashSet<ConnectionId>>,
        pub events: Mutex<Vec<(ConnectionId, Payload)>>,
    }

    impl RecordingTransport {
        pub(crate) fn with_open(connections: &[ConnectionId]) -> Self {
            let transport = Self::default();
            transport.open.lock().extend(connections.iter().copied());
            transport
        }

        pub(crate) fn events(&self) -> Vec<(ConnectionId, Payload)> {
            self.events.lock().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn is_open(&self, connection: ConnectionId) -> bool {
            self.open.lock().contains(&connection)
        }

        fn send(
            &self,
            connection: ConnectionId,
            text: String,
        ) -> impl Future<Output = Result<(), TransportError>> + Send {
            let result = if self.failing.lock().contains(&connection) {
                Err(TransportError::NotOpen(connection))
            } else {
                self.events.lock().push((connection, Payload::Text(text)));
                Ok(())
            };
            async move { result }
        }

        fn close(
            &self,
            connection: ConnectionId,
        ) -> impl Future<Output = Result<(), TransportError>> + Send {
            self.open.lock().remove(&connection);
            self.events.lock().push((connection, Payload::Close));
            async { Ok(()) }
        }
    }

    fn conn(raw: u64) -> ConnectionId {
        ConnectionId::new(raw)
    }

    #[test]
    fn test_enqueue_preserves_order() {
        let queue = DeliveryQueue::new();
        queue.enqueue(conn(1), "a");
        queue.enqueue(conn(2), "b");
        queue.enqueue_close(conn(1));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().payload, Payload::Text("a".into()));
        assert_eq!(queue.pop().unwrap().connection, conn(2));
        assert_eq!(queue.pop().unwrap().payload, Payload::Close);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_once_pops_single_frame() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::with_open(&[conn(1)]);
        queue.enqueue(conn(1), "first");
        queue.enqueue(conn(1), "second");

        let delivery = tokio_test::block_on(queue.drain_once(&transport)).unwrap();

        assert_eq!(delivery, Some(Delivery::Sent(conn(1))));
        assert_eq!(queue.len(), 1);
        assert_eq!(
            transport.events(),
            vec![(conn(1), Payload::Text("first".into()))]
        );
    }

    #[test]
    fn test_drain_empty_queue() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::default();

        let delivery = tokio_test::block_on(queue.drain_once(&transport)).unwrap();
        assert_eq!(delivery, None);
    }

    #[test]
    fn test_fifo_across_connections() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::with_open(&[conn(1), conn(2)]);
        queue.enqueue(conn(2), "b1");
        queue.enqueue(conn(1), "a1");
        queue.enqueue(conn(2), "b2");

        tokio_test::block_on(async {
            while queue.drain_once(&transport).await.unwrap().is_some() {}
        });

        let order: Vec<_> = transport.events().into_iter().map(|(c, _)| c).collect();
        assert_eq!(order, vec![conn(2), conn(1), conn(2)]);
    }

    #[test]
    fn test_close_after_pending_frames() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::with_open(&[conn(1)]);
        queue.enqueue(conn(1), "notice");
        queue.enqueue_close(conn(1));
        queue.enqueue(conn(1), "too late");

        let results = tokio_test::block_on(async {
            let mut results = Vec::new();
            while let Some(delivery) = queue.drain_once(&transport).await.unwrap() {
                results.push(delivery);
            }
            results
        });

        assert_eq!(
            results,
            vec![
                Delivery::Sent(conn(1)),
                Delivery::Closed(conn(1)),
                Delivery::Discarded(conn(1)),
            ]
        );
        assert_eq!(
            transport.events(),
            vec![
                (conn(1), Payload::Text("notice".into())),
                (conn(1), Payload::Close),
            ]
        );
    }

    #[test]
    fn test_frames_for_closed_connection_discarded() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::default();
        queue.enqueue(conn(9), "lost");

        let delivery = tokio_test::block_on(queue.drain_once(&transport)).unwrap();

        assert_eq!(delivery, Some(Delivery::Discarded(conn(9))));
        assert!(transport.events().is_empty());
    }

    #[test]
    fn test_send_failure_surfaces_and_is_not_retried() {
        let queue = DeliveryQueue::new();
        let transport = RecordingTransport::with_open(&[conn(1), conn(2)]);
        transport.failing.lock().insert(conn(1));
        queue.enqueue(conn(1), "broken");
        queue.enqueue(conn(2), "fine");

        let err = tokio_test::block_on(queue.drain_once(&transport)).unwrap_err();
        assert_eq!(err.connection, conn(1));
        assert_eq!(queue.len(), 1);

        let next = tokio_test::block_on(queue.drain_once(&transport)).unwrap();
        assert_eq!(next, Some(Delivery::Sent(conn(2))));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_over_ticks() {
        let queue = Arc::new(DeliveryQueue::new());
        let transport = Arc::new(RecordingTransport::with_open(&[conn(1)]));
        for i in 0..3 {
            queue.enqueue(conn(1), format!("frame {}", i));
        }

        let task = tokio::spawn(Arc::clone(&queue).run(Arc::clone(&transport), Duration::from_millis(5)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while !queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue should drain");
        task.abort();

        assert_eq!(transport.events().len(), 3);
    }
}
