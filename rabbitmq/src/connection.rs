use std::{collections::BTreeMap, sync::Arc};

use amqprs::{
    Ack, BasicProperties, Cancel, Close, Nack, Return,
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{Channel, QueueDeclareArguments},
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    error::RabbitMQError,
    message::{DeliveryReport, DeliveryReportSender},
};

/// Publishes waiting for a broker confirm, keyed by channel publish sequence number.
pub(crate) type PendingConfirms = Arc<Mutex<BTreeMap<u64, (String, Option<String>)>>>;

pub(crate) async fn open_rabbit_connection(
    connection_string: &str,
) -> Result<Connection, RabbitMQError> {
    info!("Attempting to open RabbitMQ connection");

    let open_conn_args = OpenConnectionArguments::try_from(connection_string).map_err(|err| {
        error!("Failed to parse connection string: {}", err);
        RabbitMQError::UriError(err.to_string())
    })?;

    let conn = Connection::open(&open_conn_args).await.map_err(|err| {
        error!("Failed to connect to RabbitMQ: {}", err);
        RabbitMQError::ConnectionError(err.to_string())
    })?;

    conn.register_callback(RabbitConnectionCallback)
        .await
        .map_err(|err| {
            error!("Failed to register connection callback: {}", err);
            RabbitMQError::ConnectionError(err.to_string())
        })?;

    info!("RabbitMQ connection established successfully");
    Ok(conn)
}

/// Opens a channel with the given callback registered on it.
pub(crate) async fn open_rabbit_channel<C>(
    conn: &Connection,
    callback: C,
) -> Result<Channel, RabbitMQError>
where
    C: ChannelCallback + Send + 'static,
{
    let rabbit_channel = conn.open_channel(None).await.map_err(|err| {
        error!("Failed to open channel: {}", err);
        RabbitMQError::OpenChannelError(err.to_string())
    })?;

    rabbit_channel
        .register_callback(callback)
        .await
        .map_err(|err| {
            error!("Failed to register channel callback: {}", err);
            RabbitMQError::OpenChannelError(err.to_string())
        })?;

    debug!("RabbitMQ channel opened successfully");
    Ok(rabbit_channel)
}

pub(crate) async fn declare_durable_queue(
    channel: &Channel,
    queue: &str,
) -> Result<(), RabbitMQError> {
    channel
        .queue_declare(QueueDeclareArguments::durable_client_named(queue))
        .await
        .map_err(|err| RabbitMQError::QueueDeclarationError(err.to_string()))?;
    Ok(())
}

/// Best-effort teardown of a channel and its connection.
pub(crate) async fn close_quietly(channel: Channel, connection: Connection) {
    if let Err(err) = channel.close().await {
        debug!("error while closing channel: {}", err);
    }
    if let Err(err) = connection.close().await {
        debug!("error while closing connection: {}", err);
    }
}

struct RabbitConnectionCallback;

#[async_trait]
impl ConnectionCallback for RabbitConnectionCallback {
    async fn close(
        &mut self,
        _connection: &Connection,
        close: Close,
    ) -> Result<(), amqprs::error::Error> {
        warn!("connection closed by broker {:?}", close);
        Ok(())
    }

    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        warn!("connection blocked {:?}", reason);
    }

    async fn unblocked(&mut self, _connection: &Connection) {
        info!("connection unblocked");
    }

    async fn secret_updated(&mut self, _connection: &Connection) {
        debug!("connection secret updated");
    }
}

/// Channel callback for consuming channels.
pub(crate) struct RabbitChannelCallback;

#[async_trait]
impl ChannelCallback for RabbitChannelCallback {
    async fn close(
        &mut self,
        _channel: &Channel,
        close: amqprs::CloseChannel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("channel closed by broker {:?}", close);
        Ok(())
    }

    async fn cancel(
        &mut self,
        _channel: &Channel,
        cancel: Cancel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("consumer cancelled by broker {:?}", cancel);
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, flow: bool) -> Result<bool, amqprs::error::Error> {
        debug!("channel flow {:?}", flow);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, _ack: Ack) {}

    async fn publish_nack(&mut self, _channel: &Channel, _nack: Nack) {}

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        _return: Return,
        _props: BasicProperties,
        _content: Vec<u8>,
    ) {
    }
}

/// Channel callback for publishing channels in confirm mode.
///
/// A confirm with `multiple` set settles every pending publish up to its sequence number;
/// otherwise only its own.
pub(crate) struct ConfirmChannelCallback {
    pending: PendingConfirms,
    reports: DeliveryReportSender,
}

impl ConfirmChannelCallback {
    pub(crate) fn new(pending: PendingConfirms, reports: DeliveryReportSender) -> Self {
        Self { pending, reports }
    }

    fn settle(&self, delivery_tag: u64, multiple: bool, failure: Option<&str>) {
        let settled = {
            let mut pending = self.pending.lock();
            if multiple {
                let remaining = pending.split_off(&(delivery_tag + 1));
                std::mem::replace(&mut *pending, remaining)
            } else {
                pending
                    .remove_entry(&delivery_tag)
                    .into_iter()
                    .collect::<BTreeMap<_, _>>()
            }
        };
        if settled.is_empty() {
            debug!("confirm for unknown delivery tag {}", delivery_tag);
        }

        for (_, (destination, key)) in settled {
            let report = match failure {
                None => DeliveryReport::delivered(&destination, key),
                Some(reason) => DeliveryReport::failed(&destination, key, reason),
            };
            if self.reports.send(report).is_err() {
                debug!("delivery report stream is closed");
            }
        }
    }
}

#[async_trait]
impl ChannelCallback for ConfirmChannelCallback {
    async fn close(
        &mut self,
        _channel: &Channel,
        close: amqprs::CloseChannel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("publishing channel closed by broker {:?}", close);
        Ok(())
    }

    async fn cancel(
        &mut self,
        _channel: &Channel,
        _cancel: Cancel,
    ) -> Result<(), amqprs::error::Error> {
        Ok(())
    }

    async fn flow(&mut self, _channel: &Channel, flow: bool) -> Result<bool, amqprs::error::Error> {
        debug!("publishing channel flow {:?}", flow);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, ack: Ack) {
        self.settle(ack.delivery_tag(), ack.mutiple(), None);
    }

    async fn publish_nack(&mut self, _channel: &Channel, nack: Nack) {
        self.settle(
            nack.delivery_tag(),
            nack.multiple(),
            Some("rejected by broker"),
        );
    }

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        _return: Return,
        _props: BasicProperties,
        content: Vec<u8>,
    ) {
        warn!("broker returned an unroutable message of {} bytes", content.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeliveryOutcome, DeliveryReportReceiver, delivery_reports};

    fn callback_with_pending(
        tags: &[u64],
    ) -> (ConfirmChannelCallback, PendingConfirms, DeliveryReportReceiver) {
        let pending = PendingConfirms::default();
        for tag in tags {
            pending
                .lock()
                .insert(*tag, ("orders".to_string(), Some(tag.to_string())));
        }
        let (tx, rx) = delivery_reports();
        (ConfirmChannelCallback::new(pending.clone(), tx), pending, rx)
    }

    fn reports(rx: &mut DeliveryReportReceiver) -> Vec<(String, DeliveryOutcome)> {
        let mut seen = Vec::new();
        while let Ok(report) = rx.try_recv() {
            seen.push((report.key.unwrap_or_default(), report.outcome));
        }
        seen
    }

    #[test]
    fn single_confirms_settle_only_their_own_tag() {
        let (callback, pending, mut rx) = callback_with_pending(&[1, 2, 3]);

        // tag 2 acked alone before tag 1 is rejected
        callback.settle(2, false, None);
        callback.settle(1, false, Some("rejected by broker"));

        assert_eq!(
            reports(&mut rx),
            vec![
                ("2".to_string(), DeliveryOutcome::Delivered),
                (
                    "1".to_string(),
                    DeliveryOutcome::Failed("rejected by broker".to_string())
                ),
            ]
        );
        assert_eq!(pending.lock().keys().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn multiple_confirm_settles_everything_up_to_its_tag() {
        let (callback, pending, mut rx) = callback_with_pending(&[1, 2, 3, 4]);

        callback.settle(3, true, None);

        let keys: Vec<_> = reports(&mut rx).into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["1", "2", "3"]);
        assert_eq!(pending.lock().keys().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn confirm_for_an_unknown_tag_reports_nothing() {
        let (callback, pending, mut rx) = callback_with_pending(&[5]);

        callback.settle(4, false, None);

        assert!(reports(&mut rx).is_empty());
        assert_eq!(pending.lock().len(), 1);
    }
}
