use std::net::TcpStream;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::{debug, info};

use crate::io::net::Binding;
use crate::protocol::resp::{RESPConnection, RESP};

/// Outbound connection from a replica to its master: drives the handshake
/// and then serves as the inbound command stream.
pub struct MasterClient {
    connection: RESPConnection,
}

impl MasterClient {
    pub fn connect(master: &Binding) -> Result<Self> {
        let stream = TcpStream::connect(master.to_string())?;
        info!("connected to master: {}", master);
        Ok(MasterClient {
            connection: RESPConnection::new(stream)?,
        })
    }

    pub fn ping_pong(&mut self) -> Result<()> {
        self.connection.send_message(&RESP::command(&["PING"]))?;
        if let (_, RESP::String(reply)) = self.connection.read_message()? {
            if reply.eq_ignore_ascii_case("PONG") {
                return Ok(());
            }
        }
        bail!("handshake PING failed");
    }

    pub fn replconf(&mut self, params: &[&str]) -> Result<()> {
        let mut command = vec!["REPLCONF"];
        command.extend_from_slice(params);
        self.connection.send_message(&RESP::command(&command))?;
        if let (_, RESP::String(reply)) = self.connection.read_message()? {
            if reply.eq_ignore_ascii_case("OK") {
                return Ok(());
            }
        }
        bail!("handshake REPLCONF {:?} failed", params);
    }

    /// PSYNC: expects `+FULLRESYNC <replid> <offset>`, then the raw RDB
    /// bulk with no trailing CRLF.
    pub fn psync(&mut self, replication_id: &str, offset: i64) -> Result<Bytes> {
        self.connection.send_message(&RESP::command(&[
            "PSYNC",
            replication_id,
            &offset.to_string(),
        ]))?;

        let (_, psync_response) = self.connection.read_message()?;
        if let RESP::String(reply) = &psync_response {
            if reply.to_uppercase().starts_with("FULLRESYNC ") {
                let rdb = self.connection.read_rdb()?;
                debug!("received RDB image of {} bytes", rdb.len());
                return Ok(rdb);
            }
        }
        bail!("unexpected PSYNC response: {}", psync_response);
    }

    /// Next frame of the replication stream with its exact wire length.
    pub fn read_replication_command(&mut self) -> Result<(usize, RESP)> {
        let (len, message) = self.connection.read_message()?;
        match message {
            array @ RESP::Array(_) => Ok((len, array)),
            other => bail!("replication message must be an array: {}", other),
        }
    }

    pub fn send(&mut self, message: &RESP) -> Result<()> {
        self.connection.send_message(message)?;
        Ok(())
    }
}
