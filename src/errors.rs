use thiserror::Error;

use crate::protocol::resp::RESP;

/// Framing-level failures. These close the connection instead of producing
/// an error reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Argument and domain errors whose `Display` form is the exact RESP error
/// string sent back to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    Unknown(String),
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    BadStreamId,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,
    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,
    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,
    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("READONLY You can't write against a read only replica.")]
    ReadOnlyReplica,
}

/// Turns a dispatch failure into the reply for the client. Errors that
/// already carry a RESP error code pass through untouched, anything else is
/// surfaced as a generic argument error.
pub fn error_reply(err: &anyhow::Error) -> RESP {
    let text = err.to_string();
    let has_code = text
        .split(' ')
        .next()
        .map_or(false, |code| !code.is_empty() && code.chars().all(|c| c.is_ascii_uppercase()));
    if has_code {
        RESP::Error(text)
    } else {
        RESP::Error(format!("ERR {}", text))
    }
}
