use thiserror::Error;

/// Flat error enum for everything the core actor can fail with.
///
/// Kept as one enum rather than per-module error types, mirroring the
/// vendored `streamhub::errors::StreamHubErrorValue` shape (one `Display`-able
/// value enum with `From` impls at the seams), but built on `thiserror`
/// rather than the `failure` crate.
#[derive(Debug, Error)]
pub enum StreamErrorValue {
    #[error("mailbox send failed, actor is gone")]
    SendError,
    #[error("reply channel dropped before actor answered")]
    RecvError,
    #[error("client {0} is not subscribed")]
    UnknownClient(String),
    #[error("client {0} already subscribed")]
    AlreadySubscribed(String),
    #[error("no storage configured for this stream")]
    NoStorage,
    #[error("unrecognized info key: {0}")]
    BadInfoKey(String),
    #[error("a format adapter and a timeshift buffer were both configured")]
    InitializedTimeshiftAndStorage,
    #[error("unknown request")]
    UnknownRequest,
    #[error("flavor adapter stopped the stream: {0}")]
    FlavorStop(String),
    #[error("seek target not found")]
    SeekNotFound,
}

#[derive(Debug, Error)]
#[error("{value}")]
pub struct StreamError {
    pub value: StreamErrorValue,
}

impl StreamError {
    #[must_use]
    pub const fn new(value: StreamErrorValue) -> Self {
        Self { value }
    }
}

impl From<StreamErrorValue> for StreamError {
    fn from(value: StreamErrorValue) -> Self {
        Self { value }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::new(StreamErrorValue::SendError)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for StreamError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::new(StreamErrorValue::RecvError)
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
