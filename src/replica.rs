use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::client::MasterClient;
use crate::connection::ConnectionHandler;
use crate::errors::CommandError;
use crate::io::net::Binding;
use crate::protocol::command::Command;
use crate::protocol::resp::RESP;
use crate::redis::RedisServer;
use crate::txn::TxnBuffer;

/// One accepted client connection in replica role: reads and transactions
/// of reads are served, writes are refused.
pub struct ReplicaConnection {
    redis: RedisServer,
    txn: TxnBuffer,
}

impl ReplicaConnection {
    pub fn new(redis: RedisServer) -> Self {
        Self {
            redis,
            txn: TxnBuffer::new(),
        }
    }
}

impl ConnectionHandler for ReplicaConnection {
    fn txn(&mut self) -> &mut TxnBuffer {
        &mut self.txn
    }

    fn dispatch(&mut self, command: &Command, params: &[String]) -> Result<Vec<RESP>> {
        if command.is_write() {
            return Ok(vec![RESP::Error(CommandError::ReadOnlyReplica.to_string())]);
        }
        self.redis.handle_command(command, params)
    }
}

/// The inbound replication link: runs the outbound handshake, then applies
/// the master's command stream while keeping an exact byte offset.
struct ReplicaLink {
    redis: RedisServer,
    master: Binding,
}

impl ReplicaLink {
    fn run(&self) -> Result<()> {
        let mut client = MasterClient::connect(&self.master)?;

        client.ping_pong()?;
        client.replconf(&["listening-port", &self.redis.binding.1.to_string()])?;
        client.replconf(&["capa", "psync2"])?;
        let rdb = client.psync("?", -1)?;
        info!(
            "full resync from {} complete ({} RDB bytes), consuming command stream",
            self.master,
            rdb.len()
        );

        // offset restarts with every successful resync
        let mut consumed_bytes: u64 = 0;
        loop {
            let (frame_len, message) = client.read_replication_command()?;
            match Command::parse_command(&message) {
                Ok((Command::REPLCONF, params))
                    if params
                        .first()
                        .is_some_and(|sub| sub.eq_ignore_ascii_case("GETACK")) =>
                {
                    // the ACK reports bytes consumed before this GETACK
                    client.send(&RESP::command(&[
                        "REPLCONF",
                        "ACK",
                        &consumed_bytes.to_string(),
                    ]))?;
                }
                Ok((command, params)) => {
                    debug!("applying replicated {} {:?}", command, params);
                    // replies are suppressed; the stream has no reply channel
                    if let Err(err) = self.redis.handle_command(&command, &params) {
                        warn!("failed to apply replicated {}: {:#}", command, err);
                    }
                }
                Err(err) => warn!("skipping bad replication frame: {:#}", err),
            }
            consumed_bytes += frame_len as u64;
        }
    }
}

/// Spawns the replication link thread; a broken link reconnects with a
/// fixed backoff and a fresh full resync.
pub fn start_replication(redis: RedisServer, master: Binding) -> Result<()> {
    let thread_name = format!("replica-link-{}", master);
    thread::Builder::new().name(thread_name).spawn(move || {
        let link = ReplicaLink { redis, master };
        loop {
            if let Err(err) = link.run() {
                warn!("replication link failed: {:#}; will reconnect", err);
            }
            thread::sleep(Duration::from_secs(2));
        }
    })?;
    Ok(())
}

/// Accept loop for replica role.
pub fn serve(listener: TcpListener, redis: RedisServer) -> Result<()> {
    info!("replica listening on {}", redis.binding);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr()?;
                let redis = redis.clone();
                thread::Builder::new()
                    .name(format!("replica-conn-{}", peer))
                    .spawn(move || {
                        let mut handler = ReplicaConnection::new(redis);
                        if let Err(err) = handler.handle_connection(stream) {
                            debug!("connection {} closed: {:#}", peer, err);
                        }
                    })?;
            }
            Err(err) => error!("accept failed: {}", err),
        }
    }
    Ok(())
}
