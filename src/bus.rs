// =============================================================================
// Topic bus — durable-topic semantics over bounded in-process queues
// =============================================================================
//
// Five topics connect the pipeline stages. Point-to-point topics (signals,
// orders, commands) are bounded mpsc queues carrying `Delivery` envelopes
// with explicit ack/nack: a nacked message is re-enqueued after the
// visibility delay with its attempt counter bumped, which is how transient
// infrastructure failures retry. Fan-out topics (confirmations, account
// updates) are broadcast channels — any number of subscribers, no ack.
// =============================================================================

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::types::{AccountUpdate, ExecutionConfirmation, Order, OrderCommand, Signal};

/// Publishing to a topic whose consumer has shut down.
#[derive(Debug, thiserror::Error)]
#[error("topic '{0}' is closed")]
pub struct TopicClosed(pub &'static str);

// ---------------------------------------------------------------------------
// Point-to-point topics
// ---------------------------------------------------------------------------

/// A message pulled off a topic. Call [`Delivery::ack`] when fully handled or
/// [`Delivery::nack`] to schedule redelivery.
pub struct Delivery<T> {
    pub payload: T,
    /// 1 on first delivery, incremented per redelivery.
    pub attempt: u32,
    topic: &'static str,
    tx: mpsc::Sender<Delivery<T>>,
    redelivery_delay: Duration,
}

impl<T: Send + 'static> Delivery<T> {
    /// Acknowledge the message. Consuming the envelope is the ack.
    pub fn ack(self) {}

    /// Negative-acknowledge: re-enqueue after the visibility delay.
    pub fn nack(self) {
        let Delivery {
            payload,
            attempt,
            topic,
            tx,
            redelivery_delay,
        } = self;

        debug!(topic, attempt, "message nacked — scheduling redelivery");

        tokio::spawn(async move {
            tokio::time::sleep(redelivery_delay).await;
            let redelivery = Delivery {
                payload,
                attempt: attempt + 1,
                topic,
                tx: tx.clone(),
                redelivery_delay,
            };
            if tx.send(redelivery).await.is_err() {
                warn!(topic, "redelivery dropped — topic consumer is gone");
            }
        });
    }
}

/// Producer handle for a point-to-point topic. Cheap to clone.
#[derive(Clone)]
pub struct Topic<T> {
    name: &'static str,
    tx: mpsc::Sender<Delivery<T>>,
    redelivery_delay: Duration,
}

impl<T: Send + 'static> Topic<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish a message (first delivery attempt). Blocks when the bounded
    /// queue is full, which applies backpressure to the producing stage.
    pub async fn publish(&self, payload: T) -> Result<(), TopicClosed> {
        let delivery = Delivery {
            payload,
            attempt: 1,
            topic: self.name,
            tx: self.tx.clone(),
            redelivery_delay: self.redelivery_delay,
        };
        self.tx
            .send(delivery)
            .await
            .map_err(|_| TopicClosed(self.name))
    }
}

/// Consumer handle for a point-to-point topic. Exactly one per topic.
pub struct TopicReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<Delivery<T>>,
}

impl<T> TopicReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Await the next delivery. `None` when every producer handle is gone.
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        self.rx.recv().await
    }
}

/// Create a point-to-point topic with the given queue capacity and
/// nack-redelivery visibility delay.
pub fn topic<T: Send + 'static>(
    name: &'static str,
    capacity: usize,
    redelivery_delay: Duration,
) -> (Topic<T>, TopicReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Topic {
            name,
            tx,
            redelivery_delay,
        },
        TopicReceiver { name, rx },
    )
}

// ---------------------------------------------------------------------------
// Fan-out topics
// ---------------------------------------------------------------------------

/// Broadcast topic: every subscriber sees every message, no ack semantics.
#[derive(Clone)]
pub struct Fanout<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Fanout<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish to all current subscribers. A topic with no subscribers
    /// silently drops the message, matching broker semantics for an
    /// unsubscribed topic.
    pub fn publish(&self, payload: T) {
        let _ = self.tx.send(payload);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Producer handles for all five pipeline topics. Cloned into every stage.
#[derive(Clone)]
pub struct Bus {
    pub standardized_signals: Topic<Signal>,
    pub trading_orders: Topic<Order>,
    pub order_commands: Topic<OrderCommand>,
    pub execution_confirmations: Fanout<ExecutionConfirmation>,
    pub account_updates: Fanout<AccountUpdate>,
}

/// Consumer ends of the point-to-point topics. Handed to the owning stage at
/// start-up; there is exactly one consumer per topic.
pub struct BusReceivers {
    pub standardized_signals: TopicReceiver<Signal>,
    pub trading_orders: TopicReceiver<Order>,
    pub order_commands: TopicReceiver<OrderCommand>,
}

impl Bus {
    pub fn new(capacity: usize, redelivery_delay: Duration) -> (Self, BusReceivers) {
        let (standardized_signals, standardized_signals_rx) =
            topic("standardized-signals", capacity, redelivery_delay);
        let (trading_orders, trading_orders_rx) =
            topic("trading-orders", capacity, redelivery_delay);
        let (order_commands, order_commands_rx) =
            topic("order-commands", capacity, redelivery_delay);

        (
            Self {
                standardized_signals,
                trading_orders,
                order_commands,
                execution_confirmations: Fanout::new("execution-confirmations", capacity),
                account_updates: Fanout::new("account-updates", capacity),
            },
            BusReceivers {
                standardized_signals: standardized_signals_rx,
                trading_orders: trading_orders_rx,
                order_commands: order_commands_rx,
            },
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_recv_delivers_in_order() {
        let (tx, mut rx) = topic::<u32>("test", 8, Duration::from_millis(5));
        tx.publish(1).await.unwrap();
        tx.publish(2).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, 1);
        assert_eq!(first.attempt, 1);
        first.ack();

        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, 2);
        second.ack();
    }

    #[tokio::test]
    async fn nack_redelivers_with_bumped_attempt() {
        let (tx, mut rx) = topic::<&'static str>("test", 8, Duration::from_millis(5));
        tx.publish("msg").await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.attempt, 1);
        delivery.nack();

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.payload, "msg");
        assert_eq!(redelivered.attempt, 2);
        redelivered.ack();
    }

    #[tokio::test]
    async fn publish_to_closed_topic_errors() {
        let (tx, rx) = topic::<u32>("test", 8, Duration::from_millis(5));
        drop(rx);
        let err = tx.publish(1).await.unwrap_err();
        assert_eq!(err.to_string(), "topic 'test' is closed");
    }

    #[tokio::test]
    async fn fanout_reaches_every_subscriber() {
        let fanout: Fanout<u32> = Fanout::new("test", 8);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();

        fanout.publish(7);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn fanout_without_subscribers_drops_silently() {
        let fanout: Fanout<u32> = Fanout::new("test", 8);
        // Must not panic or error.
        fanout.publish(1);
    }
}
