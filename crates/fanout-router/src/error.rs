use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Envelope reached dispatch without a queue key")]
    MissingQueueKey,

    #[error("Lane closed: {0}")]
    LaneClosed(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Config(String),
}
