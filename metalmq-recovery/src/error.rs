use crate::model::{self, ChannelError, ChannelNumber, ClassMethod, ConnectionError, LocalError};
use std::fmt;

/// Represents a connection or channel error. If `channel` is `None` it is a
/// connection error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientError {
    pub channel: Option<model::ChannelNumber>,
    pub code: u16,
    pub message: String,
    pub class_method: model::ClassMethod,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("channel", &self.channel)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("class_method", &format!("{:08X}", &self.class_method))
            .finish()
    }
}

impl std::error::Error for ClientError {}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($channel:expr, $code:expr, $message:expr, $cm:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::ClientError {
            channel: $channel,
            code: $code,
            message: ::std::string::String::from($message),
            class_method: $cm,
        }))
    };
}

impl ClientError {
    pub fn connection(code: ConnectionError, message: &str, class_method: ClassMethod) -> Self {
        ClientError {
            channel: None,
            code: code as u16,
            message: message.to_string(),
            class_method,
        }
    }

    pub fn channel(channel: ChannelNumber, code: ChannelError, message: &str, class_method: ClassMethod) -> Self {
        ClientError {
            channel: Some(channel),
            code: code as u16,
            message: message.to_string(),
            class_method,
        }
    }

    /// Error which is raised by the client and not by the server.
    pub fn local(code: LocalError, message: &str) -> Self {
        ClientError {
            channel: None,
            code: code as u16,
            message: message.to_string(),
            class_method: 0,
        }
    }

    pub fn connection_lost(message: &str) -> Self {
        Self::local(LocalError::ConnectionLost, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ChannelError::NotFound as u16
    }

    /// Transient conditions, the same call can succeed on a new connection.
    pub fn is_retryable(&self) -> bool {
        const CONNECTION_LOST: u16 = LocalError::ConnectionLost as u16;
        const TIMEOUT: u16 = LocalError::Timeout as u16;
        const CONNECTION_FORCED: u16 = ConnectionError::ConnectionForced as u16;
        const INTERNAL_ERROR: u16 = ConnectionError::InternalError as u16;

        matches!(self.code, CONNECTION_LOST | TIMEOUT | CONNECTION_FORCED | INTERNAL_ERROR)
    }

    /// Classify the error the way the recovery engine handles it.
    pub fn into_outcome<T>(self) -> Outcome<T> {
        if self.is_not_found() {
            Outcome::ExpectedAbsence(self)
        } else if self.is_retryable() {
            Outcome::RetryableFault(self)
        } else {
            Outcome::FatalFault(self)
        }
    }
}

/// A broker response as the recovery engine sees it.
///
/// `ExpectedAbsence` is the "not found" answer of a passive declare. It is swallowed only where an
/// existence check is made, during replay it means that somebody else deleted the entity.
/// `FatalFault`s (authentication, authorization, protocol errors, inequivalent declarations) stop
/// automatic recovery for good.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    ExpectedAbsence(ClientError),
    RetryableFault(ClientError),
    FatalFault(ClientError),
}

impl<T> From<Result<T, ClientError>> for Outcome<T> {
    fn from(result: Result<T, ClientError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(e) => e.into_outcome(),
        }
    }
}
