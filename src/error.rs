use std::result::Result as StdResult;

use crate::bson::Document;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported op code {0}")]
    UnsupportedOpCode(i32),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no servers available: {0}")]
    NoServersAvailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The server answered but reported `ok != 1`. Carries the server's
    /// error document verbatim so callers can inspect server-specific fields.
    #[error("command failed with code {code}: {message}")]
    CommandFailure {
        code: i32,
        message: String,
        response: Document,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T> = StdResult<T, Error>;

impl Error {
    /// Build a `CommandFailure` from a server reply document.
    pub fn from_command_response(response: Document) -> Error {
        let code = response.get_i32("code").unwrap_or(0);
        let message = response
            .get_str("errmsg")
            .unwrap_or("command failed")
            .to_string();
        Error::CommandFailure {
            code,
            message,
            response,
        }
    }

    /// True for errors that indicate the transport underneath is gone.
    pub fn is_network_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed)
    }
}
