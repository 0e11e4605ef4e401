//! In-process broker implementing [`MessageSource`] and [`MessageSink`].
//!
//! Queues are plain FIFOs. Fetched messages stay in flight until committed; a reconnect puts
//! uncommitted deliveries back at the head of their queue, like a broker redelivering after a
//! channel loss. [`MemoryBroker::sever`] kills every client opened so far.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    consumer::MessageSource,
    error::RabbitMQError,
    message::{DeliveryReport, DeliveryReportSender, OutboundMessage, RawMessage},
    producer::MessageSink,
};

type Stored = (Option<String>, Vec<u8>);

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Stored>>,
    in_flight: BTreeMap<u64, (String, Stored)>,
    next_tag: u64,
    epoch: u64,
    reconnects: usize,
    commits: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    arrivals: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self, queue: &str) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            queue: queue.to_owned(),
            epoch: self.state.lock().epoch,
        }
    }

    pub fn sink(&self, reports: DeliveryReportSender) -> MemorySink {
        MemorySink {
            broker: self.clone(),
            epoch: Some(self.state.lock().epoch),
            reports,
        }
    }

    /// Appends a message to `queue` directly, bypassing any producer.
    pub fn publish(&self, queue: &str, key: Option<&str>, payload: Vec<u8>) {
        self.state
            .lock()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back((key.map(str::to_owned), payload));
        self.arrivals.notify_waiters();
    }

    /// Removes and returns everything waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<(Option<String>, Vec<u8>)> {
        self.state
            .lock()
            .queues
            .get_mut(queue)
            .map(|messages| messages.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }

    /// Breaks every client connected so far; they report dead until reconnected.
    pub fn sever(&self) {
        self.state.lock().epoch += 1;
        self.arrivals.notify_waiters();
    }

    fn reconnect(&self) -> u64 {
        let mut state = self.state.lock();
        state.reconnects += 1;
        let requeued = std::mem::take(&mut state.in_flight);
        for (_, (queue, stored)) in requeued.into_iter().rev() {
            state.queues.entry(queue).or_default().push_front(stored);
        }
        state.epoch
    }

    fn take(&self, queue: &str, max: usize, epoch: u64) -> Result<Vec<RawMessage>, RabbitMQError> {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return Err(RabbitMQError::NotConnected);
        }

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some((key, payload)) = state.queues.get_mut(queue).and_then(VecDeque::pop_front)
            else {
                break;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            state
                .in_flight
                .insert(tag, (queue.to_owned(), (key.clone(), payload.clone())));
            batch.push(RawMessage {
                destination: queue.to_owned(),
                key,
                payload,
                delivery_tag: tag,
                generation: epoch,
            });
        }
        Ok(batch)
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    queue: String,
    epoch: u64,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch(&mut self, max: usize, poll: Duration) -> Result<Vec<RawMessage>, RabbitMQError> {
        let arrival = self.broker.arrivals.notified();
        let batch = self.broker.take(&self.queue, max, self.epoch)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let _ = tokio::time::timeout(poll, arrival).await;
        self.broker.take(&self.queue, max, self.epoch)
    }

    async fn commit(&mut self, batch: &[RawMessage]) -> Result<(), RabbitMQError> {
        let mut state = self.broker.state.lock();
        if state.epoch != self.epoch {
            return Err(RabbitMQError::NotConnected);
        }
        for message in batch.iter().filter(|m| m.generation == self.epoch) {
            state.in_flight.remove(&message.delivery_tag);
        }
        state.commits += 1;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.broker.state.lock().epoch == self.epoch
    }

    async fn reconnect(&mut self) -> Result<(), RabbitMQError> {
        self.epoch = self.broker.reconnect();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RabbitMQError> {
        Ok(())
    }
}

pub struct MemorySink {
    broker: MemoryBroker,
    epoch: Option<u64>,
    reports: DeliveryReportSender,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        if !self.is_alive().await {
            return Err(RabbitMQError::NotConnected);
        }
        self.broker.publish(
            &message.destination,
            message.key.as_deref(),
            message.payload,
        );
        let _ = self
            .reports
            .send(DeliveryReport::delivered(&message.destination, message.key));
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.epoch == Some(self.broker.state.lock().epoch)
    }

    async fn reconnect(&mut self) -> Result<(), RabbitMQError> {
        self.epoch = Some(self.broker.reconnect());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RabbitMQError> {
        self.epoch = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconnect_requeues_uncommitted_deliveries_in_order() {
        let broker = MemoryBroker::new();
        broker.publish("orders", Some("1"), b"a".to_vec());
        broker.publish("orders", Some("2"), b"b".to_vec());

        let mut source = broker.source("orders");
        let batch = source.fetch(10, Duration::from_millis(5)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(broker.in_flight(), 2);

        broker.sever();
        assert!(!source.is_alive().await);
        assert!(source.commit(&batch).await.is_err());

        source.reconnect().await.unwrap();
        let again = source.fetch(10, Duration::from_millis(5)).await.unwrap();
        let keys: Vec<_> = again.iter().map(|m| m.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn fetch_waits_for_late_arrivals_within_poll() {
        let broker = MemoryBroker::new();
        let mut source = broker.source("orders");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("orders", None, b"late".to_vec());
        });

        let batch = source.fetch(10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"late".to_vec());
    }
}
