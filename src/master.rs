use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandler;
use crate::errors::CommandError;
use crate::io::net::{Binding, Port};
use crate::protocol::command::Command;
use crate::protocol::rdb::empty_rdb;
use crate::protocol::resp::{RESPConnection, RESP};
use crate::redis::RedisServer;
use crate::txn::TxnBuffer;

/// (replica id, acknowledged offset) delivered back to a waiting WAIT.
type AckResponse = (u64, u64);

enum ReplicaMessage {
    /// write to forward; no response expected
    Replicate(RESP),
    /// request an ACK round-trip and report it on the channel
    GetAck {
        reply: Sender<AckResponse>,
        replica_id: u64,
        timeout: Duration,
    },
}

struct Replica {
    id: u64,
    binding: Option<Binding>,
    sender: Sender<ReplicaMessage>,
    acked_offset: u64,
}

/// Backlog and registry live under one lock so that attaching a replica
/// (snapshot + register) is atomic against concurrent propagation.
#[derive(Default)]
struct ReplicationState {
    backlog: Vec<RESP>,
    replicas: Vec<Replica>,
}

#[derive(Clone)]
pub struct MasterServer {
    pub redis: RedisServer,
    replication: Arc<RwLock<ReplicationState>>,
    next_replica_id: Arc<AtomicU64>,
}

impl MasterServer {
    pub fn new(redis: RedisServer) -> Self {
        MasterServer {
            redis,
            replication: Arc::new(RwLock::new(ReplicationState::default())),
            next_replica_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replication.read().unwrap().replicas.len()
    }

    /// Re-encodes one successful write, advances the offset once by its
    /// encoded length, appends it to the backlog and fans it out. Replicas
    /// with a dead channel are dropped from the set.
    fn propagate(&self, command: &Command, params: &[String]) -> Result<()> {
        let mut parts = vec![RESP::Bulk(command.to_string())];
        parts.extend(params.iter().map(|p| RESP::bulk(p)));
        let message = RESP::Array(parts);
        let encoded_len = message.to_bytes()?.len() as u64;

        let mut state = self.replication.write().unwrap();
        self.redis
            .master_repl_offset
            .fetch_add(encoded_len, Ordering::SeqCst);
        state.backlog.push(message.clone());
        debug!(
            "replicating {} ({} bytes) to {} replicas",
            message,
            encoded_len,
            state.replicas.len()
        );
        state
            .replicas
            .retain(|replica| match replica.sender.send(ReplicaMessage::Replicate(message.clone())) {
                Ok(_) => true,
                Err(_) => {
                    warn!("dropping replica {}: channel closed", replica.id);
                    false
                }
            });
        Ok(())
    }

    /// Atomically registers a new replica and snapshots the backlog it must
    /// be primed with. Writes propagated after this call arrive on `sender`.
    fn register_replica(
        &self,
        sender: Sender<ReplicaMessage>,
        binding: Option<Binding>,
    ) -> (u64, Vec<RESP>) {
        let id = self.next_replica_id.fetch_add(1, Ordering::SeqCst);
        let replica = Replica {
            id,
            binding,
            sender,
            acked_offset: 0,
        };
        let mut state = self.replication.write().unwrap();
        let backlog = state.backlog.clone();
        info!(
            "replica {} ({:?}) attached, {} now active",
            id,
            replica.binding,
            state.replicas.len() + 1
        );
        state.replicas.push(replica);
        (id, backlog)
    }

    fn deregister_replica(&self, id: u64) {
        let mut state = self.replication.write().unwrap();
        state.replicas.retain(|replica| replica.id != id);
        info!("replica {} detached, {} remaining", id, state.replicas.len());
    }

    fn record_ack(&self, id: u64, offset: u64) {
        let mut state = self.replication.write().unwrap();
        if let Some(replica) = state.replicas.iter_mut().find(|r| r.id == id) {
            replica.acked_offset = replica.acked_offset.max(offset);
        }
    }

    /// WAIT body: broadcast GETACK to replicas behind `target` and count
    /// acknowledgements at or past it until `required` is reached or the
    /// timer fires. Replicas already at the target count without a
    /// round-trip. Returns the observed count, never the requested one.
    fn count_acks(&self, required: u64, target: u64, timeout_ms: u64) -> u64 {
        let (tx, rx) = mpsc::channel::<AckResponse>();
        // a zero WAIT timeout means no deadline; the per-replica ACK read
        // still needs a finite timeout (zero is invalid for socket reads)
        let ack_timeout = if timeout_ms == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_millis(timeout_ms)
        };
        let mut acked = 0u64;
        let mut pending = 0u64;
        {
            let state = self.replication.read().unwrap();
            for replica in &state.replicas {
                if replica.acked_offset >= target {
                    acked += 1;
                } else if replica
                    .sender
                    .send(ReplicaMessage::GetAck {
                        reply: tx.clone(),
                        replica_id: replica.id,
                        timeout: ack_timeout,
                    })
                    .is_ok()
                {
                    pending += 1;
                }
            }
        }
        drop(tx);

        debug!(
            "WAIT: target offset {}, {} pre-acked, {} asked",
            target, acked, pending
        );
        // timeout 0 means no deadline
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        while acked < required && pending > 0 {
            let response = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    rx.recv_timeout(deadline - now)
                }
                None => rx.recv().map_err(mpsc::RecvTimeoutError::from),
            };
            match response {
                Ok((replica_id, offset)) => {
                    pending -= 1;
                    self.record_ack(replica_id, offset);
                    if offset >= target {
                        acked += 1;
                    }
                }
                Err(_) => break,
            }
        }
        acked
    }
}

/// One accepted connection in master role. Becomes a replication
/// connection if the client ever issues PSYNC.
pub struct MasterConnection {
    master: MasterServer,
    remote_host: SocketAddr,
    replica_binding: Option<Binding>,
    txn: TxnBuffer,
}

impl MasterConnection {
    pub fn new(master: MasterServer, remote_host: SocketAddr) -> Self {
        MasterConnection {
            master,
            remote_host,
            replica_binding: None,
            txn: TxnBuffer::new(),
        }
    }

    /// PSYNC turned this connection into the replication channel for one
    /// replica: prime it with the backlog, then forward writes and relay
    /// GETACK round-trips until the replica goes away.
    fn serve_replica_connection(&mut self, connection: &mut RESPConnection) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let (replica_id, backlog) = self
            .master
            .register_replica(tx, self.replica_binding.clone());
        info!(
            "PSYNC from {} completed, connection is now replication connection {}",
            self.remote_host, replica_id
        );

        let result = (|| -> Result<()> {
            for message in &backlog {
                connection.send_message(message)?;
            }
            for received in rx {
                match received {
                    ReplicaMessage::Replicate(message) => {
                        connection.send_message(&message)?;
                    }
                    ReplicaMessage::GetAck {
                        reply,
                        replica_id,
                        timeout,
                    } => {
                        connection.send_message(&RESP::command(&["REPLCONF", "GETACK", "*"]))?;
                        let previous_timeout = connection.read_timeout()?;
                        connection.set_read_timeout(Some(timeout))?;
                        match connection.read_message() {
                            Ok((_, ack)) => {
                                if let Some(offset) = parse_ack(&ack) {
                                    debug!("replica {} acked offset {}", replica_id, offset);
                                    // WAIT may have returned already
                                    let _ = reply.send((replica_id, offset));
                                }
                            }
                            Err(err) => {
                                debug!("gave up waiting for ACK from replica {}: {:#}", replica_id, err);
                            }
                        }
                        connection.set_read_timeout(previous_timeout)?;
                    }
                }
            }
            Ok(())
        })();

        self.master.deregister_replica(replica_id);
        result
    }
}

fn parse_ack(message: &RESP) -> Option<u64> {
    match Command::parse_command(message) {
        Ok((Command::REPLCONF, params)) => match &params[..] {
            [sub_command, offset] if sub_command.eq_ignore_ascii_case("ACK") => {
                offset.parse().ok()
            }
            _ => None,
        },
        _ => None,
    }
}

impl ConnectionHandler for MasterConnection {
    fn txn(&mut self) -> &mut TxnBuffer {
        &mut self.txn
    }

    fn dispatch(&mut self, command: &Command, params: &[String]) -> Result<Vec<RESP>> {
        match command {
            Command::REPLCONF => {
                // minimal implementation of https://redis.io/docs/latest/commands/replconf/
                match &params[..] {
                    [sub_command, value] if sub_command.eq_ignore_ascii_case("listening-port") => {
                        let replica_port = value.parse::<Port>()?;
                        self.replica_binding =
                            Some(Binding(self.remote_host.ip().to_string(), replica_port));
                        Ok(vec![RESP::String("OK".to_string())])
                    }
                    [sub_command, ..] if sub_command.eq_ignore_ascii_case("GETACK") => {
                        // only meaningful on a replica; a master ignores it
                        Ok(vec![])
                    }
                    _ => Ok(vec![RESP::String("OK".to_string())]),
                }
            }
            Command::WAIT => {
                // minimal implementation of https://redis.io/docs/latest/commands/wait/
                let [required, timeout_ms] = params else {
                    return Err(CommandError::WrongArity(command.to_string()).into());
                };
                let (Ok(required), Ok(timeout_ms)) =
                    (required.parse::<i64>(), timeout_ms.parse::<i64>())
                else {
                    return Err(CommandError::NotInteger.into());
                };
                if required < 0 || timeout_ms < 0 {
                    bail!("invalid WAIT command");
                }
                let target = self.master.redis.master_repl_offset.load(Ordering::SeqCst);
                if target == 0 {
                    // nothing was ever propagated, every replica is caught up
                    return Ok(vec![RESP::Int(self.master.replica_count() as i64)]);
                }
                let acked = self
                    .master
                    .count_acks(required as u64, target, timeout_ms as u64);
                Ok(vec![RESP::Int(acked as i64)])
            }
            Command::PSYNC => {
                // minimal implementation of https://redis.io/docs/latest/commands/psync/
                match &params[..] {
                    [repl_id, offset]
                        if (repl_id == "?" && offset == "-1")
                            || *repl_id == self.master.redis.master_replid =>
                    {
                        Ok(vec![
                            RESP::String(format!(
                                "FULLRESYNC {} 0",
                                self.master.redis.master_replid
                            )),
                            RESP::File(empty_rdb()),
                        ])
                    }
                    _ => bail!("invalid PSYNC command"),
                }
            }
            _ => {
                let replies = self.master.redis.handle_command(command, params)?;
                // writes fan out to replicas, standalone or from EXEC
                if command.is_mutating() && !matches!(replies.first(), Some(RESP::Error(_))) {
                    self.master.propagate(command, params)?;
                }
                Ok(replies)
            }
        }
    }

    fn after_reply(&mut self, connection: &mut RESPConnection, command: &Command) -> Result<()> {
        if *command == Command::PSYNC {
            self.serve_replica_connection(connection)?;
            bail!("replication connection closed");
        }
        Ok(())
    }
}

/// Accept loop for master role: one named reader thread per connection.
pub fn serve(listener: TcpListener, master: MasterServer) -> Result<()> {
    info!("master listening on {}", master.redis.binding);
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr()?;
                let master = master.clone();
                thread::Builder::new()
                    .name(format!("master-conn-{}", peer))
                    .spawn(move || {
                        let mut handler = MasterConnection::new(master, peer);
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
