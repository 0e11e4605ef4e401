/// Error types for RabbitMQ operations
#[derive(Debug, thiserror::Error)]
pub enum RabbitMQError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error starting to consume from a queue
    #[error("Error while starting to consume from a queue: {0}")]
    SubscriptionError(String),
    /// Error closing a channel or a connection
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// The broker rejected or failed to accept a publish
    #[error("Error while publishing to {destination}: {reason}")]
    PublishError { destination: String, reason: String },
    /// The producer background loop is gone, nothing can be enqueued anymore
    #[error("Error while publishing a message - dispatcher was dropped or closed")]
    DispatcherClosed,
    /// Error while acknowledging a batch failed
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// Failed messages could not be handed to the retry destination; the batch was released
    /// uncommitted
    #[error("Error while forwarding {count} failed messages to {destination}")]
    RetryForwardError { destination: String, count: usize },
    /// The client is not connected; the liveness check will recreate it
    #[error("Client is not connected")]
    NotConnected,
}
