use thiserror::Error;

use crate::mail_reader::Uid;

/// Errors raised by the mail session and everything built on top of it.
///
/// The variants fall in three classes, see [`MailError::class`]: fatal errors
/// stop the agent, connection errors trigger a reconnect and message errors are
/// scoped to the one message being handled.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("server rejected {command} for message {uid}: {reason}")]
    Command {
        uid: Uid,
        command: String,
        reason: String,
    },

    #[error("failed to fetch message {uid}: {reason}")]
    Fetch { uid: Uid, reason: String },

    #[error("failed to parse message {uid}: {reason}")]
    Parse { uid: Uid, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wrong credentials and the like, never retried.
    Fatal,
    /// The connection is gone or unusable, reconnect and resume.
    Connection,
    /// Only the current message is affected.
    Message,
}

impl MailError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MailError::Auth(_) | MailError::Credentials(_) => ErrorClass::Fatal,
            MailError::Network(_) | MailError::Protocol(_) | MailError::NotConnected => {
                ErrorClass::Connection
            }
            MailError::Command { .. } | MailError::Fetch { .. } | MailError::Parse { .. } => {
                ErrorClass::Message
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn is_connection_lost(&self) -> bool {
        self.class() == ErrorClass::Connection
    }
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        MailError::Network(err.to_string())
    }
}

impl From<async_imap::error::Error> for MailError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;

        match err {
            Error::Io(e) => MailError::Network(e.to_string()),
            Error::ConnectionLost => MailError::Network("connection lost".to_string()),
            Error::No(msg) => MailError::Protocol(format!("NO {}", msg)),
            Error::Bad(msg) => MailError::Protocol(format!("BAD {}", msg)),
            other => MailError::Protocol(other.to_string()),
        }
    }
}
