//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// RabbitMQ plumbing for the order matcher: batch consumption with retry forwarding and batch
// acknowledgement, asynchronous producing with publisher confirms, and client recreation on
// liveness failure for both sides. An in-process broker backs the same traits for tests.
//
// | Module      | Description                                                     |
// |-------------|-----------------------------------------------------------------|
// | consumer    | MessageSource trait, AmqpSource, batch Consumer                 |
// | producer    | MessageSink trait, AmqpSink, Producer handle / loop             |
// | message     | Raw / outbound messages and delivery reports                    |
// | memory      | In-process broker implementing both traits                      |
// | connection  | Connection / channel helpers and amqprs callbacks               |
//
//--------------------------------------------------------------------------------------------------

mod connection;
mod consumer;
mod error;
pub mod memory;
mod message;
mod producer;

pub use consumer::{AmqpSource, BatchSummary, Consumer, ConsumerConfig, MessageSource};
pub use error::RabbitMQError;
pub use message::{
    DeliveryOutcome, DeliveryReport, DeliveryReportReceiver, DeliveryReportSender,
    OutboundMessage, RawMessage, delivery_reports, log_delivery_reports,
};
pub use producer::{AmqpSink, MessageSink, Producer, ProducerHandle, ProducerLoop};
