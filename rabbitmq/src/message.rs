use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// A message pulled from a source queue.
///
/// `delivery_tag` and `generation` identify the delivery on the client that fetched it, so a
/// batch fetched before a reconnect is never acknowledged on the new client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub destination: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    pub generation: u64,
}

/// A message waiting to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(destination: &str, payload: Vec<u8>) -> Self {
        Self {
            destination: destination.to_owned(),
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

/// Out-of-band result of one publish, emitted once the broker confirmed or refused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub destination: String,
    pub key: Option<String>,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    pub fn delivered(destination: &str, key: Option<String>) -> Self {
        Self {
            destination: destination.to_owned(),
            key,
            outcome: DeliveryOutcome::Delivered,
        }
    }

    pub fn failed(destination: &str, key: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            destination: destination.to_owned(),
            key,
            outcome: DeliveryOutcome::Failed(reason.into()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }
}

pub type DeliveryReportSender = UnboundedSender<DeliveryReport>;
pub type DeliveryReportReceiver = UnboundedReceiver<DeliveryReport>;

/// Creates the delivery report stream shared by a sink and its producer loop.
pub fn delivery_reports() -> (DeliveryReportSender, DeliveryReportReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Drains a delivery report stream, logging failures. Failed deliveries are not retried.
///
/// Returns the number of failed reports seen once every sender is dropped.
pub async fn log_delivery_reports(mut reports: DeliveryReportReceiver) -> usize {
    let mut failures = 0;
    while let Some(report) = reports.recv().await {
        match &report.outcome {
            DeliveryOutcome::Delivered => {
                debug!("delivered message to {} key={:?}", report.destination, report.key)
            }
            DeliveryOutcome::Failed(reason) => {
                failures += 1;
                error!(
                    "failed to deliver message to {} key={:?}: {}",
                    report.destination, report.key, reason
                );
            }
        }
    }
    failures
}
