//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Batch consumption with out-of-band retry. A batch is fetched, every message is processed on
// its own task, failures are forwarded to a retry queue with their original key and finally the
// whole batch is acknowledged at once. A liveness task recreates the client when it dies.
//
// | Component       | Description                                                |
// |-----------------|------------------------------------------------------------|
// | MessageSource   | Something batches can be fetched from and committed to     |
// | AmqpSource      | RabbitMQ source, one durable queue, manual acks            |
// | ConsumerConfig  | Batch size, poll timeout, retry queue, liveness interval   |
// | Consumer        | The fetch / fan-out / retry / commit loop                  |
//
//--------------------------------------------------------------------------------------------------

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use amqprs::{
    channel::{BasicAckArguments, BasicConsumeArguments, BasicQosArguments, Channel, ConsumerMessage},
    connection::Connection,
};
use async_trait::async_trait;
use tokio::{
    select,
    sync::{Mutex, mpsc::UnboundedReceiver},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    connection::{
        RabbitChannelCallback, close_quietly, declare_durable_queue, open_rabbit_channel,
        open_rabbit_connection,
    },
    error::RabbitMQError,
    message::RawMessage,
    producer::ProducerHandle,
};

/// A client batches of messages can be pulled from.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Fetches up to `max` messages. Each wait for the next message is bounded by `poll`; an
    /// empty batch is a normal result.
    async fn fetch(&mut self, max: usize, poll: Duration) -> Result<Vec<RawMessage>, RabbitMQError>;

    /// Acknowledges every message of `batch` at once.
    async fn commit(&mut self, batch: &[RawMessage]) -> Result<(), RabbitMQError>;

    async fn is_alive(&self) -> bool;

    /// Tears down the current client (if any) and opens a new one. Uncommitted deliveries of
    /// the old client are redelivered by the broker.
    async fn reconnect(&mut self) -> Result<(), RabbitMQError>;

    async fn close(&mut self) -> Result<(), RabbitMQError>;
}

struct ConsumeLink {
    connection: Connection,
    channel: Channel,
    deliveries: UnboundedReceiver<ConsumerMessage>,
}

/// RabbitMQ source consuming one durable queue with manual acknowledgements.
///
/// Prefetch is set to the batch size so a batch never waits on unacknowledged deliveries of the
/// previous one.
pub struct AmqpSource {
    connection_string: String,
    queue: String,
    prefetch: u16,
    link: Option<ConsumeLink>,
    generation: u64,
}

impl AmqpSource {
    pub async fn connect(
        connection_string: &str,
        queue: &str,
        prefetch: u16,
    ) -> Result<Self, RabbitMQError> {
        let mut source = Self {
            connection_string: connection_string.to_owned(),
            queue: queue.to_owned(),
            prefetch,
            link: None,
            generation: 0,
        };
        source.open_link().await?;
        Ok(source)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn open_link(&mut self) -> Result<(), RabbitMQError> {
        let connection = open_rabbit_connection(&self.connection_string).await?;
        let channel = open_rabbit_channel(&connection, RabbitChannelCallback).await?;
        declare_durable_queue(&channel, &self.queue).await?;

        channel
            .basic_qos(BasicQosArguments::new(0, self.prefetch, false))
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;

        let (_ctag, deliveries) = channel
            .basic_consume_rx(BasicConsumeArguments::new(&self.queue, ""))
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;

        self.generation += 1;
        self.link = Some(ConsumeLink {
            connection,
            channel,
            deliveries,
        });
        info!("consuming from {} (generation {})", self.queue, self.generation);
        Ok(())
    }

    fn to_raw(&self, message: ConsumerMessage) -> Option<RawMessage> {
        let deliver = message.deliver?;
        let key = message
            .basic_properties
            .as_ref()
            .and_then(|props| props.message_id().cloned());
        Some(RawMessage {
            destination: self.queue.clone(),
            key,
            payload: message.content.unwrap_or_default(),
            delivery_tag: deliver.delivery_tag(),
            generation: self.generation,
        })
    }
}

#[async_trait]
impl MessageSource for AmqpSource {
    async fn fetch(&mut self, max: usize, poll: Duration) -> Result<Vec<RawMessage>, RabbitMQError> {
        let mut received = Vec::with_capacity(max);
        {
            let link = self.link.as_mut().ok_or(RabbitMQError::NotConnected)?;
            while received.len() < max {
                match timeout(poll, link.deliveries.recv()).await {
                    Ok(Some(message)) => received.push(message),
                    Ok(None) if received.is_empty() => return Err(RabbitMQError::NotConnected),
                    Ok(None) | Err(_) => break,
                }
            }
        }

        Ok(received
            .into_iter()
            .filter_map(|message| self.to_raw(message))
            .collect())
    }

    async fn commit(&mut self, batch: &[RawMessage]) -> Result<(), RabbitMQError> {
        let link = self.link.as_ref().ok_or(RabbitMQError::NotConnected)?;
        let last_tag = batch
            .iter()
            .filter(|message| message.generation == self.generation)
            .map(|message| message.delivery_tag)
            .max();

        match last_tag {
            Some(tag) => link
                .channel
                .basic_ack(BasicAckArguments::new(tag, true))
                .await
                .map_err(|err| RabbitMQError::AckMessageError(err.to_string())),
            None => {
                if !batch.is_empty() {
                    warn!("skipping commit of a batch fetched before the client was recreated");
                }
                Ok(())
            }
        }
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

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub retry_destination: String,
    pub liveness_interval: Duration,
}

/// Counts of one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub redirected: usize,
    /// failures that could not be handed to the retry producer
    pub unforwarded: usize,
}

/// Drives a [`MessageSource`]: fetch, process concurrently, redirect failures, commit.
pub struct Consumer<S: MessageSource> {
    source: Arc<Mutex<S>>,
    retry: ProducerHandle,
    config: ConsumerConfig,
}

impl<S: MessageSource> Consumer<S> {
    /// # Arguments
    ///
    /// * `source` - Where batches are fetched from.
    /// * `retry` - Producer used to forward failed messages to `config.retry_destination`.
    /// * `config` - Batch and liveness settings.
    pub fn new(source: S, retry: ProducerHandle, config: ConsumerConfig) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            retry,
            config,
        }
    }

    /// Runs until `cancel` fires. Cancellation stops new fetches; the batch in progress is
    /// processed and committed before the source is closed.
    ///
    /// `process` is called once per message on its own task. An error (or a panic) sends the
    /// message, unmodified and with the same key, to the retry destination. If a failure cannot
    /// be forwarded, the batch is released uncommitted for redelivery and the consumer stops
    /// with [`RabbitMQError::RetryForwardError`].
    pub async fn consume<F, Fut, E>(
        &self,
        cancel: CancellationToken,
        process: F,
    ) -> Result<(), RabbitMQError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let process = Arc::new(process);
        let liveness_cancel = cancel.child_token();
        let liveness = self.spawn_liveness(liveness_cancel.clone());
        let mut outcome = Ok(());

        while !cancel.is_cancelled() {
            let fetched = {
                let mut source = self.source.lock().await;
                source
                    .fetch(self.config.batch_size, self.config.poll_timeout)
                    .await
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) => {
                    error!("failed to fetch a batch: {}", err);
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.config.poll_timeout) => continue,
                    }
                }
            };

            if batch.is_empty() {
                continue;
            }

            let summary = self.process_batch(&batch, &process).await;
            debug!(
                "batch done: {} processed, {} redirected to {}",
                summary.processed, summary.redirected, self.config.retry_destination
            );

            if summary.unforwarded > 0 {
                // never ack a failure that is not on the retry queue
                error!(
                    "{} failed messages could not be forwarded, releasing batch of {} uncommitted",
                    summary.unforwarded,
                    batch.len()
                );
                if let Err(err) = self.source.lock().await.reconnect().await {
                    error!("failed to release uncommitted batch: {}", err);
                }
                outcome = Err(RabbitMQError::RetryForwardError {
                    destination: self.config.retry_destination.clone(),
                    count: summary.unforwarded,
                });
                break;
            }

            if let Err(err) = self.source.lock().await.commit(&batch).await {
                error!("failed to commit batch of {} messages: {}", batch.len(), err);
            }
        }

        liveness_cancel.cancel();
        if let Err(err) = liveness.await {
            error!("liveness task failed: {}", err);
        }

        info!("consumer stopped, closing source");
        self.source.lock().await.close().await?;
        outcome
    }

    /// Processes every message of `batch` concurrently and waits for all of them.
    pub async fn process_batch<F, Fut, E>(&self, batch: &[RawMessage], process: &Arc<F>) -> BatchSummary
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let tasks: Vec<JoinHandle<Result<(), String>>> = batch
            .iter()
            .map(|message| {
                let process = process.clone();
                let payload = message.payload.clone();
                tokio::spawn(async move { process(payload).await.map_err(|err| err.to_string()) })
            })
            .collect();

        let mut summary = BatchSummary::default();
        for (message, task) in batch.iter().zip(tasks) {
            let failure = match task.await {
                Ok(Ok(())) => None,
                Ok(Err(reason)) => Some(reason),
                Err(join_err) => Some(format!("processing task failed: {}", join_err)),
            };

            summary.processed += 1;
            if let Some(reason) = failure {
                match self.redirect(message, &reason) {
                    Ok(()) => summary.redirected += 1,
                    Err(err) => {
                        error!("failed to forward message to retry queue: {}", err);
                        summary.unforwarded += 1;
                    }
                }
            }
        }
        summary
    }

    fn redirect(&self, message: &RawMessage, reason: &str) -> Result<(), RabbitMQError> {
        warn!(
            "message key={:?} from {} failed ({}), forwarding to {}",
            message.key, message.destination, reason, self.config.retry_destination
        );
        match &message.key {
            Some(key) => self.retry.produce_with_key(
                &self.config.retry_destination,
                key,
                message.payload.clone(),
            ),
            None => self
                .retry
                .produce(&self.config.retry_destination, message.payload.clone()),
        }
    }

    fn spawn_liveness(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let source = self.source.clone();
        let period = self.config.liveness_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut source = source.lock().await;
                        if source.is_alive().await {
                            continue;
                        }
                        warn!("consumer client is not alive, trying to reconnect");
                        match source.reconnect().await {
                            Ok(()) => info!("consumer client recreated"),
                            Err(err) => error!("failed to recreate consumer client: {}", err),
                        }
                    }
                }
            }
        })
    }
}
