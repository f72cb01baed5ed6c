use std::net::TcpStream;

use anyhow::Result;
use tracing::debug;

use crate::errors::{error_reply, CommandError};
use crate::protocol::command::Command;
use crate::protocol::resp::{RESPConnection, RESP};
use crate::txn::TxnBuffer;

/// Read-decode-dispatch-reply loop shared by both roles. Implementations
/// provide the role-specific dispatch; transaction interception lives here
/// so MULTI works the same against a master and a replica.
pub trait ConnectionHandler {
    fn dispatch(&mut self, command: &Command, params: &[String]) -> Result<Vec<RESP>>;

    fn txn(&mut self) -> &mut TxnBuffer;

    /// Runs after the reply went out; PSYNC uses this to turn the
    /// connection into a replication connection.
    fn after_reply(&mut self, _connection: &mut RESPConnection, _command: &Command) -> Result<()> {
        Ok(())
    }

    fn handle_connection(&mut self, stream: TcpStream) -> Result<()> {
        let mut connection = RESPConnection::new(stream)?;
        loop {
            self.handle_message(&mut connection)?;
        }
    }

    fn handle_message(&mut self, connection: &mut RESPConnection) -> Result<()> {
        let (_, message) = connection.read_message()?;
        debug!("received: {}", message);

        let (command, params) = match Command::parse_command(&message) {
            Ok(parsed) => parsed,
            Err(err) => {
                // unknown names get an error reply; framing errors close
                return if err.downcast_ref::<CommandError>().is_some() {
                    connection.send_message(&error_reply(&err))?;
                    Ok(())
                } else {
                    Err(err)
                };
            }
        };

        let in_transaction = self.txn().is_active();
        let replies = match &command {
            Command::MULTI => vec![self
                .txn()
                .begin()
                .map_or_else(|err| RESP::Error(err.to_string()), |_| RESP::String("OK".to_string()))],
            Command::DISCARD => vec![self
                .txn()
                .discard()
                .map_or_else(|err| RESP::Error(err.to_string()), |_| RESP::String("OK".to_string()))],
            Command::EXEC => self.exec_queued()?,
            _ if in_transaction => {
                self.txn().push(command.clone(), params);
                vec![RESP::String("QUEUED".to_string())]
            }
            _ => match self.dispatch(&command, &params) {
                Ok(replies) => replies,
                Err(err) => vec![error_reply(&err)],
            },
        };

        connection.send_messages(&replies.iter().collect::<Vec<&RESP>>())?;
        self.after_reply(connection, &command)
    }

    /// EXEC: one outer array, one reply per queued command, in order.
    fn exec_queued(&mut self) -> Result<Vec<RESP>> {
        let queued = match self.txn().take() {
            Ok(queued) => queued,
            Err(err) => return Ok(vec![RESP::Error(err.to_string())]),
        };
        let mut replies = Vec::with_capacity(queued.len());
        for (command, params) in queued {
            match self.dispatch(&command, &params) {
                Ok(command_replies) => replies.extend(command_replies),
                Err(err) => replies.push(error_reply(&err)),
            }
        }
        Ok(vec![RESP::Array(replies)])
    }
}
