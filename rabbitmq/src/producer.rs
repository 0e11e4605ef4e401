//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Outbound side of the broker client. Callers enqueue messages through a cloneable handle; a
// single background loop hands them to a sink, watches the sink's liveness and recreates the
// underlying client when it dies.
//
// | Component       | Description                                                |
// |-----------------|------------------------------------------------------------|
// | MessageSink     | Something that can deliver one message to the broker       |
// | AmqpSink        | RabbitMQ sink with publisher confirms                      |
// | Producer        | Builds a handle / loop pair around a sink                  |
// | ProducerHandle  | Cloneable, non-blocking produce / produce_with_key API     |
// | ProducerLoop    | Background delivery + liveness loop                        |
//
//--------------------------------------------------------------------------------------------------

use std::{collections::HashSet, time::Duration};

use amqprs::{
    BasicProperties,
    channel::{BasicPublishArguments, Channel, ConfirmSelectArguments},
    connection::Connection,
};
use async_trait::async_trait;
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connection::{
        ConfirmChannelCallback, PendingConfirms, close_quietly, declare_durable_queue,
        open_rabbit_channel, open_rabbit_connection,
    },
    error::RabbitMQError,
    message::{DeliveryReport, DeliveryReportSender, OutboundMessage},
};

/// How long a cancelled producer keeps draining messages that are still being enqueued.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A client able to hand single messages to the broker.
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Hands one message to the broker. The final delivery outcome may arrive later on the
    /// delivery report stream.
    async fn send(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError>;

    async fn is_alive(&self) -> bool;

    /// Tears down the current client (if any) and opens a new one.
    async fn reconnect(&mut self) -> Result<(), RabbitMQError>;

    async fn close(&mut self) -> Result<(), RabbitMQError>;
}

struct PublishLink {
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
    next_sequence: u64,
}

/// RabbitMQ sink publishing to durable queues on the default exchange.
///
/// The channel runs in confirm mode: broker acks and nacks are turned into delivery reports.
/// The message key travels as the AMQP `message_id` property.
pub struct AmqpSink {
    connection_string: String,
    app_id: String,
    link: Option<PublishLink>,
    pending: PendingConfirms,
    reports: DeliveryReportSender,
}

impl AmqpSink {
    pub async fn connect(
        connection_string: &str,
        app_id: &str,
        reports: DeliveryReportSender,
    ) -> Result<Self, RabbitMQError> {
        let mut sink = Self {
            connection_string: connection_string.to_owned(),
            app_id: app_id.to_owned(),
            link: None,
            pending: PendingConfirms::default(),
            reports,
        };
        sink.open_link().await?;
        Ok(sink)
    }

    async fn open_link(&mut self) -> Result<(), RabbitMQError> {
        let connection = open_rabbit_connection(&self.connection_string).await?;
        let callback = ConfirmChannelCallback::new(self.pending.clone(), self.reports.clone());
        let channel = open_rabbit_channel(&connection, callback).await?;
        channel
            .confirm_select(ConfirmSelectArguments::default())
            .await
            .map_err(|err| RabbitMQError::OpenChannelError(err.to_string()))?;

        self.link = Some(PublishLink {
            connection,
            channel,
            declared: HashSet::new(),
            next_sequence: 1,
        });
        Ok(())
    }

    /// Reports every publish still waiting for a confirm as failed. Confirms for them can no
    /// longer arrive once the channel is gone.
    fn fail_pending(&self, reason: &str) {
        let abandoned = std::mem::take(&mut *self.pending.lock());
        for (_, (destination, key)) in abandoned {
            let _ = self
                .reports
                .send(DeliveryReport::failed(&destination, key, reason));
        }
    }

    fn properties(&self, message: &OutboundMessage) -> BasicProperties {
        let mut props = BasicProperties::default();
        props
            .with_app_id(&self.app_id)
            .with_content_type("application/json")
            .with_delivery_mode(2);
        if let Some(key) = &message.key {
            props.with_message_id(key);
        }
        props
    }
}

#[async_trait]
impl MessageSink for AmqpSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        let props = self.properties(&message);
        let pending = self.pending.clone();
        let link = self.link.as_mut().ok_or(RabbitMQError::NotConnected)?;

        if !link.declared.contains(&message.destination) {
            declare_durable_queue(&link.channel, &message.destination).await?;
            link.declared.insert(message.destination.clone());
        }

        let sequence = link.next_sequence;
        pending.lock().insert(
            sequence,
            (message.destination.clone(), message.key.clone()),
        );

        let args = BasicPublishArguments::new("", &message.destination);
        if let Err(err) = link.channel.basic_publish(props, message.payload, args).await {
            pending.lock().remove(&sequence);
            return Err(RabbitMQError::PublishError {
                destination: message.destination,
                reason: err.to_string(),
            });
        }

        link.next_sequence += 1;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.connection.is_open() && link.channel.is_open())
            .unwrap_or(false)
    }

    async fn reconnect(&mut self) -> Result<(), RabbitMQError> {
        if let Some(link) = self.link.take() {
            close_quietly(link.channel, link.connection).await;
        }
        self.fail_pending("client was recreated before the broker confirmed");
        self.open_link().await
    }

    async fn close(&mut self) -> Result<(), RabbitMQError> {
        if let Some(link) = self.link.take() {
            link.channel
                .close()
                .await
                .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))?;
            link.connection
                .close()
                .await
                .map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))?;
        }
        Ok(())
    }
}

/// Entry point for building a producer around a sink.
pub struct Producer;

impl Producer {
    /// Splits a sink into a cloneable handle and the loop that must be driven with
    /// [`ProducerLoop::run`] for anything to be delivered.
    ///
    /// # Arguments
    ///
    /// * `sink` - The broker client messages are handed to.
    /// * `reports` - Delivery report stream; failed sends are reported here.
    /// * `liveness_interval` - How often the sink's liveness is checked.
    pub fn new<S: MessageSink>(
        sink: S,
        reports: DeliveryReportSender,
        liveness_interval: Duration,
    ) -> (ProducerHandle, ProducerLoop<S>) {
        let (tx, rx) = unbounded_channel();
        (
            ProducerHandle { dispatcher: tx },
            ProducerLoop {
                sink,
                queue: rx,
                reports,
                liveness_interval,
                drain_grace: DEFAULT_DRAIN_GRACE,
            },
        )
    }
}

/// Non-blocking publishing API. Cheap to clone and share between tasks.
#[derive(Debug, Clone)]
pub struct ProducerHandle {
    dispatcher: UnboundedSender<OutboundMessage>,
}

impl ProducerHandle {
    /// Enqueues `payload` for asynchronous delivery to `destination`.
    pub fn produce(&self, destination: &str, payload: Vec<u8>) -> Result<(), RabbitMQError> {
        self.enqueue(OutboundMessage::new(destination, payload))
    }

    /// Enqueues `payload` for asynchronous delivery to `destination`, keyed by `key`.
    pub fn produce_with_key(
        &self,
        destination: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> Result<(), RabbitMQError> {
        self.enqueue(OutboundMessage::new(destination, payload).with_key(key))
    }

    pub fn enqueue(&self, message: OutboundMessage) -> Result<(), RabbitMQError> {
        self.dispatcher
            .send(message)
            .map_err(|_| RabbitMQError::DispatcherClosed)
    }
}

/// Background half of a producer.
pub struct ProducerLoop<S: MessageSink> {
    sink: S,
    queue: UnboundedReceiver<OutboundMessage>,
    reports: DeliveryReportSender,
    liveness_interval: Duration,
    drain_grace: Duration,
}

impl<S: MessageSink> ProducerLoop<S> {
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    /// Delivers enqueued messages until cancelled, recreating the sink whenever the periodic
    /// liveness check fails. After cancellation, messages that keep arriving within the drain
    /// grace period are still delivered, then the sink is closed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RabbitMQError> {
        let mut ticker = interval(self.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("producer cancelled, draining queue");
                    break;
                }
                _ = ticker.tick() => self.recover().await,
                message = self.queue.recv() => match message {
                    Some(message) => self.deliver(message).await,
                    None => {
                        info!("every producer handle was dropped");
                        break;
                    }
                },
            }
        }

        while let Ok(Some(message)) = timeout(self.drain_grace, self.queue.recv()).await {
            self.deliver(message).await;
        }

        self.sink.close().await
    }

    async fn recover(&mut self) {
        if self.sink.is_alive().await {
            return;
        }
        warn!("producer client is not alive, trying to reconnect");
        match self.sink.reconnect().await {
            Ok(()) => info!("producer client recreated"),
            Err(err) => error!("failed to recreate producer client: {}", err),
        }
    }

    async fn deliver(&mut self, message: OutboundMessage) {
        let destination = message.destination.clone();
        let key = message.key.clone();
        if let Err(err) = self.sink.send(message).await {
            error!("error while publishing to {}: {}", destination, err);
            let _ = self
                .reports
                .send(DeliveryReport::failed(&destination, key, err.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryBroker,
        message::{DeliveryOutcome, delivery_reports},
    };

    #[tokio::test]
    async fn handle_fails_once_loop_is_gone() {
        let broker = MemoryBroker::new();
        let (reports, _rx) = delivery_reports();
        let (handle, producer_loop) =
            Producer::new(broker.sink(reports.clone()), reports, Duration::from_secs(60));
        drop(producer_loop);

        let result = handle.produce("orders", b"{}".to_vec());
        assert!(matches!(result, Err(RabbitMQError::DispatcherClosed)));
    }

    #[tokio::test]
    async fn delivers_keyed_messages_and_reports_them() {
        let broker = MemoryBroker::new();
        let (reports, mut rx) = delivery_reports();
        let (handle, producer_loop) =
            Producer::new(broker.sink(reports.clone()), reports, Duration::from_secs(60));
        let producer_loop = producer_loop.with_drain_grace(Duration::from_millis(20));

        let cancel = CancellationToken::new();
        let running = tokio::spawn(producer_loop.run(cancel.clone()));

        handle.produce_with_key("matches", "42", b"first".to_vec()).unwrap();
        handle.produce("matches", b"second".to_vec()).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.outcome, DeliveryOutcome::Delivered);
        assert_eq!(first.key.as_deref(), Some("42"));
        assert!(second.is_delivered());

        cancel.cancel();
        running.await.unwrap().unwrap();

        let stored = broker.drain("matches");
        assert_eq!(
            stored,
            vec![
                (Some("42".to_string()), b"first".to_vec()),
                (None, b"second".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn failed_send_is_reported_not_redelivered() {
        let broker = MemoryBroker::new();
        broker.sever();
        let (reports, mut rx) = delivery_reports();
        // liveness far in the future so the sink stays broken for this send
        let (handle, producer_loop) =
            Producer::new(broker.sink(reports.clone()), reports, Duration::from_secs(3600));
        let producer_loop = producer_loop.with_drain_grace(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let running = tokio::spawn(producer_loop.run(cancel.clone()));

        handle.produce_with_key("matches", "7", b"lost".to_vec()).unwrap();
        let report = rx.recv().await.unwrap();
        assert!(!report.is_delivered());
        assert_eq!(report.key.as_deref(), Some("7"));

        cancel.cancel();
        running.await.unwrap().unwrap();
        assert!(broker.drain("matches").is_empty());
    }

    #[tokio::test]
    async fn liveness_check_recreates_dead_sink() {
        let broker = MemoryBroker::new();
        let (reports, _rx) = delivery_reports();
        let (handle, producer_loop) = Producer::new(
            broker.sink(reports.clone()),
            reports,
            Duration::from_millis(10),
        );
        let producer_loop = producer_loop.with_drain_grace(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let running = tokio::spawn(producer_loop.run(cancel.clone()));

        broker.sever();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker.reconnects() >= 1);

        handle.produce("matches", b"after".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(broker.drain("matches").len(), 1);
    }
}
