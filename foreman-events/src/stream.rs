//! The per-execution fan-out bus for task events.

use std::collections::HashMap;
use std::collections::HashSet;

use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TaskEvent;

/// The capacity of each subscriber's channel.
///
/// Publication blocks once a subscriber's buffer is full; this is deliberate
/// back-pressure rather than event dropping.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// One subscription to an execution's events.
#[derive(Clone, Debug)]
struct Subscriber {
    /// The sending half of the subscriber's channel.
    sender: mpsc::Sender<TaskEvent>,
    /// Canceled when the subscription is force-closed, aborting any
    /// publication blocked on this subscriber's full buffer.
    closed: CancellationToken,
}

/// The guarded state of the stream.
#[derive(Debug, Default)]
struct Inner {
    /// The current subscribers, keyed by execution id.
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// Execution ids whose terminal event has been published (or which were
    /// force-closed). Subscriptions for these ids are born closed.
    terminated: HashSet<String>,
}

/// An in-memory publish/subscribe stream of [`TaskEvent`]s keyed by
/// execution id.
///
/// Within one execution id, every subscriber observes events in the order
/// they were published; publication of a terminal event closes every
/// subscriber channel for that id. Events are not buffered for late
/// subscribers: subscribe before (or immediately after) starting the
/// execution, or accept the loss.
#[derive(Debug, Default)]
pub struct EventStream {
    /// The guarded subscriber map.
    inner: RwLock<Inner>,
}

impl EventStream {
    /// Creates a new, empty event stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the events of an execution.
    ///
    /// Multiple concurrent subscribers per execution are supported; each
    /// receives every event published after it subscribed. If the
    /// execution already reached its terminal event, the returned channel
    /// is empty and already closed (the first `recv` yields `None`).
    pub async fn subscribe(&self, execution_id: &str) -> mpsc::Receiver<TaskEvent> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        let mut inner = self.inner.write().await;
        if !inner.terminated.contains(execution_id) {
            inner
                .subscribers
                .entry(execution_id.to_owned())
                .or_default()
                .push(Subscriber {
                    sender,
                    closed: CancellationToken::new(),
                });
        }

        receiver
    }

    /// Publishes an event to every current subscriber of its execution id.
    ///
    /// Delivery is synchronous with respect to the subscriber channels: a
    /// subscriber with a full buffer blocks the publisher until it drains
    /// or the id is [closed](Self::close). A subscriber whose receiver was
    /// dropped is skipped. If the event is terminal, all subscriber
    /// channels for the id are closed after the send and later
    /// subscriptions for the id are born closed.
    pub async fn publish(&self, event: TaskEvent) {
        let subscribers = {
            let inner = self.inner.read().await;
            inner.subscribers.get(&event.execution_id).cloned()
        };

        if let Some(subscribers) = subscribers {
            for subscriber in &subscribers {
                tokio::select! {
                    _ = subscriber.closed.cancelled() => {}
                    result = subscriber.sender.send(event.clone()) => {
                        if result.is_err() {
                            debug!(
                                execution_id = %event.execution_id,
                                "subscriber receiver dropped; skipping delivery"
                            );
                        }
                    }
                }
            }
        }

        if event.event_type.is_terminal() {
            self.close(&event.execution_id).await;
        }
    }

    /// Closes every remaining subscriber of an execution and drops its
    /// subscriber set.
    ///
    /// A publication blocked on one of the execution's subscribers is
    /// unblocked. Idempotent.
    pub async fn close(&self, execution_id: &str) {
        let mut inner = self.inner.write().await;
        inner.terminated.insert(execution_id.to_owned());

        if let Some(subscribers) = inner.subscribers.remove(execution_id) {
            debug!(execution_id, "closing subscriber channels");
            for subscriber in subscribers {
                subscriber.closed.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::TaskEventType;
    use crate::TaskStatus;

    /// Publishes a started event, `count` output lines, and a completed
    /// event for `id`.
    async fn publish_lifecycle(stream: &EventStream, id: &str, count: usize) {
        stream
            .publish(TaskEvent::message(id, TaskEventType::TaskStarted, "started"))
            .await;
        for i in 0..count {
            stream
                .publish(TaskEvent::message(
                    id,
                    TaskEventType::TaskOutput,
                    format!("L{}", i + 1),
                ))
                .await;
        }
        stream
            .publish(TaskEvent::terminal(id, TaskStatus::Succeeded, None))
            .await;
    }

    #[tokio::test]
    async fn subscribers_observe_publish_order_and_terminal_close() {
        let stream = EventStream::new();
        let mut first = stream.subscribe("exec-1").await;
        let mut second = stream.subscribe("exec-1").await;

        publish_lifecycle(&stream, "exec-1", 5).await;

        for receiver in [&mut first, &mut second] {
            let started = receiver.recv().await.expect("should receive started");
            assert_eq!(started.event_type, TaskEventType::TaskStarted);

            for i in 0..5 {
                let output = receiver.recv().await.expect("should receive output");
                assert_eq!(output.event_type, TaskEventType::TaskOutput);
                assert_eq!(output.payload.as_message(), Some(format!("L{}", i + 1)).as_deref());
            }

            let terminal = receiver.recv().await.expect("should receive terminal");
            assert_eq!(terminal.event_type, TaskEventType::TaskCompleted);

            // The channel must be closed after the terminal event.
            assert!(receiver.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn events_are_isolated_per_execution() {
        let stream = EventStream::new();
        let mut other = stream.subscribe("exec-2").await;

        publish_lifecycle(&stream, "exec-1", 1).await;

        stream
            .publish(TaskEvent::message(
                "exec-2",
                TaskEventType::TaskOutput,
                "only",
            ))
            .await;

        let event = other.recv().await.expect("should receive an event");
        assert_eq!(event.execution_id, "exec-2");
        assert_eq!(event.payload.as_message(), Some("only"));
    }

    #[tokio::test]
    async fn late_subscription_is_born_closed() {
        let stream = EventStream::new();
        publish_lifecycle(&stream, "exec-1", 1).await;

        let mut receiver = stream.subscribe("exec-1").await;
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let stream = EventStream::new();
        stream
            .publish(TaskEvent::message(
                "exec-1",
                TaskEventType::TaskOutput,
                "dropped",
            ))
            .await;

        // A non-terminal publish does not terminate the id.
        let mut receiver = stream.subscribe("exec-1").await;
        stream
            .publish(TaskEvent::message("exec-1", TaskEventType::TaskOutput, "kept"))
            .await;
        let event = receiver.recv().await.expect("should receive an event");
        assert_eq!(event.payload.as_message(), Some("kept"));
    }

    #[tokio::test]
    async fn terminal_publish_without_subscribers_terminates_the_id() {
        let stream = EventStream::new();
        stream
            .publish(TaskEvent::terminal("exec-1", TaskStatus::Failed, Some("boom".into())))
            .await;

        let mut receiver = stream.subscribe("exec-1").await;
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let stream = EventStream::new();
        let mut receiver = stream.subscribe("exec-1").await;

        stream.close("exec-1").await;
        stream.close("exec-1").await;

        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_backpressures_publish_until_close() {
        let stream = std::sync::Arc::new(EventStream::new());

        // This subscriber never reads.
        let slow = stream.subscribe("exec-1").await;
        let mut draining = stream.subscribe("exec-1").await;

        let publisher = {
            let stream = stream.clone();
            tokio::spawn(async move {
                for i in 0..SUBSCRIBER_CHANNEL_CAPACITY + 50 {
                    stream
                        .publish(TaskEvent::message(
                            "exec-1",
                            TaskEventType::TaskOutput,
                            format!("L{i}"),
                        ))
                        .await;
                }
            })
        };

        // The draining subscriber observes events in order while the
        // publisher makes progress.
        for i in 0..SUBSCRIBER_CHANNEL_CAPACITY {
            let event = draining.recv().await.expect("should receive an event");
            assert_eq!(event.payload.as_message(), Some(format!("L{i}")).as_deref());
        }

        // The slow subscriber's buffer is now full, so the publisher must
        // be blocked well before its last event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        // Closing the id unblocks the publisher and closes both channels.
        stream.close("exec-1").await;
        tokio::time::timeout(Duration::from_secs(5), publisher)
            .await
            .expect("publisher should unblock after close")
            .expect("publisher should not panic");

        drop(slow);
        while let Some(event) = draining.recv().await {
            assert_eq!(event.event_type, TaskEventType::TaskOutput);
        }
    }
}
