use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, info};
use uuid::Uuid;

use crate::args::{named_option, named_option_list};
use crate::config::Config;
use crate::errors::CommandError;
use crate::io::net::Binding;
use crate::protocol::command::Command;
use crate::protocol::resp::RESP;
use crate::store::KVStore;
use crate::stream::{StreamEntryId, StreamRecord, StreamWaiter};

/// Role-independent server core: the keyspace, the replication identity and
/// the handlers for every command both roles share. Cloning is cheap; all
/// clones see the same store.
#[derive(Clone)]
pub struct RedisServer {
    pub binding: Binding,
    pub is_master: bool,
    pub master_replid: String,
    pub master_repl_offset: Arc<AtomicU64>,
    store: Arc<RwLock<KVStore>>,
    db_dir: String,
    db_filename: String,
}

impl RedisServer {
    pub fn new(config: &Config, binding: Binding, is_master: bool) -> Result<Self> {
        let server = RedisServer {
            binding,
            is_master,
            master_replid: new_replid(),
            master_repl_offset: Arc::new(AtomicU64::new(0)),
            store: Arc::new(RwLock::new(KVStore::new())),
            db_dir: config.dir.clone(),
            db_filename: config.dbfilename.clone(),
        };
        server.load_snapshot(config)?;
        Ok(server)
    }

    /// Handles every command that does not need the master's replica
    /// registry. Role gating: PING and SET reply only in master role.
    pub fn handle_command(&self, cmd: &Command, params: &[String]) -> Result<Vec<RESP>> {
        match (cmd, params) {
            (Command::PING, _) => {
                // a replica absorbs PINGs so it never echoes into the
                // inbound replication stream
                if self.is_master {
                    Ok(vec![RESP::String("PONG".to_string())])
                } else {
                    Ok(vec![])
                }
            }
            (Command::ECHO, [message]) => Ok(vec![RESP::bulk(message)]),
            (Command::SET, [key, value, options @ ..]) => {
                // minimal implementation of https://redis.io/docs/latest/commands/set/
                let px_expiration = named_option::<u64>(options, "PX")?.map(Duration::from_millis);
                self.store.write().unwrap().insert_value(key, value, px_expiration);
                if self.is_master {
                    Ok(vec![RESP::String("OK".to_string())])
                } else {
                    Ok(vec![])
                }
            }
            (Command::GET, [key]) => Ok(vec![self
                .store
                .read()
                .unwrap()
                .get_value(key)
                .map_or(RESP::Null, RESP::String)]),
            (Command::DEL, keys) if !keys.is_empty() => {
                let mut store = self.store.write().unwrap();
                let removed = keys.iter().filter(|key| store.remove(key)).count();
                Ok(vec![RESP::Int(removed as i64)])
            }
            (Command::INCR, [key]) => Ok(vec![self
                .store
                .write()
                .unwrap()
                .increment(key)
                .map_or_else(|err| RESP::Error(err.to_string()), RESP::Int)]),
            (Command::TYPE, [key]) => Ok(vec![RESP::String(
                self.store.read().unwrap().get_type(key).to_string(),
            )]),
            (Command::KEYS, [pattern]) => {
                // only the enumerate-everything form is supported
                if pattern != "*" {
                    bail!("unsupported KEYS pattern: {}", pattern);
                }
                Ok(vec![RESP::Array(
                    self.store
                        .read()
                        .unwrap()
                        .keys()
                        .iter()
                        .map(|k| RESP::bulk(k))
                        .collect(),
                )])
            }
            (Command::XADD, [key, id, key_value_pairs @ ..]) => {
                // XADD key id field value [field value ...]
                if key_value_pairs.is_empty() || key_value_pairs.len() % 2 != 0 {
                    return Err(CommandError::WrongArity(cmd.to_string()).into());
                }
                let mut fields = Vec::with_capacity(key_value_pairs.len() / 2);
                let mut iter = key_value_pairs.iter();
                while let Some((field, value)) = iter.next().zip(iter.next()) {
                    fields.push((field.to_string(), value.to_string()));
                }
                Ok(vec![self
                    .store
                    .write()
                    .unwrap()
                    .append_stream(key, id, fields)
                    .map_or_else(
                        |err| RESP::Error(err.to_string()),
                        |new_id| RESP::bulk(&new_id.to_string()),
                    )])
            }
            (Command::XRANGE, [key, from_id, to_id]) => {
                // XRANGE key id-from id-to, inclusive on both ends
                let from_id = parse_range_start(from_id)?;
                let to_id = parse_range_end(to_id)?;
                let records = self.store.read().unwrap().range_stream(key, from_id, to_id);
                Ok(vec![RESP::Array(
                    records.iter().map(encode_stream_record).collect(),
                )])
            }
            (Command::XREAD, params) => self.xread(params),
            (Command::INFO, [sub_command]) => {
                // minimal implementation of https://redis.io/docs/latest/commands/info/
                match sub_command.to_ascii_uppercase().as_str() {
                    "REPLICATION" => {
                        let role = if self.is_master { "master" } else { "slave" };
                        let offset = self.master_repl_offset.load(Ordering::SeqCst);
                        let pairs = [
                            ("role", role.to_string()),
                            ("master_replid", self.master_replid.clone()),
                            ("master_repl_offset", offset.to_string()),
                        ];
                        let info = pairs
                            .map(|(k, v)| format!("{}:{}", k, v))
                            .join("\r\n");
                        Ok(vec![RESP::bulk(&info)])
                    }
                    _ => bail!("unknown INFO section: {}", sub_command),
                }
            }
            (Command::CONFIG, [sub_command, key]) => {
                match (sub_command.to_uppercase().as_str(), key.to_lowercase().as_str()) {
                    ("GET", "dir") => Ok(vec![RESP::Array(vec![
                        RESP::bulk(key),
                        RESP::bulk(&self.db_dir),
                    ])]),
                    ("GET", "dbfilename") => Ok(vec![RESP::Array(vec![
                        RESP::bulk(key),
                        RESP::bulk(&self.db_filename),
                    ])]),
                    _ => bail!("unknown CONFIG parameter: {}", key),
                }
            }
            _ => Err(CommandError::WrongArity(cmd.to_string()).into()),
        }
    }

    /// XREAD [BLOCK ms] STREAMS key... id...
    fn xread(&self, params: &[String]) -> Result<Vec<RESP>> {
        let block_ms = named_option::<u64>(params, "BLOCK")?;
        let Some(sub_params) = named_option_list(params, "STREAMS") else {
            bail!("invalid XREAD command");
        };
        if sub_params.is_empty() || sub_params.len() % 2 != 0 {
            bail!("invalid XREAD command");
        }
        let (keys, ids) = sub_params.split_at(sub_params.len() / 2);

        // `$` resolves against the tail at command arrival
        let baselines: HashMap<String, StreamEntryId> = {
            let store = self.store.read().unwrap();
            let mut pairs = HashMap::new();
            for (key, id) in keys.iter().zip(ids.iter()) {
                let from_id = if id == "$" {
                    store.last_stream_id(key)
                } else {
                    id.parse::<StreamEntryId>()?
                };
                pairs.insert(key.clone(), from_id);
            }
            pairs
        };

        let Some(block_ms) = block_ms else {
            // snapshot only, possibly the empty array
            return Ok(vec![self.xread_values(keys, &baselines)]);
        };

        // register before the first scan, so an XADD racing the scan is
        // caught either by the scan or by the waiter
        let waiter: Arc<StreamWaiter> = Arc::new((Mutex::new(None), Condvar::new()));
        self.store.write().unwrap().add_stream_waiter(keys, &waiter);

        let deadline = (block_ms > 0).then(|| Instant::now() + Duration::from_millis(block_ms));
        loop {
            if let RESP::Array(results) = self.xread_values(keys, &baselines) {
                if !results.is_empty() {
                    return Ok(vec![RESP::Array(results)]);
                }
            }
            if !wait_for_stream_event(&waiter, deadline) {
                debug!("blocked XREAD timed out");
                return Ok(vec![RESP::Null]);
            }
        }
    }

    /// One `[key, [records...]]` element per stream that has data after its
    /// baseline, in command order.
    fn xread_values(&self, keys: &[String], baselines: &HashMap<String, StreamEntryId>) -> RESP {
        let store = self.store.read().unwrap();
        let mut all_results = vec![];
        for key in keys {
            let Some(baseline) = baselines.get(key) else {
                continue;
            };
            let records = store.read_stream_after(key, *baseline);
            if records.is_empty() {
                continue;
            }
            all_results.push(RESP::Array(vec![
                RESP::bulk(key),
                RESP::Array(records.iter().map(encode_stream_record).collect()),
            ]));
        }
        RESP::Array(all_results)
    }

    fn load_snapshot(&self, config: &Config) -> Result<()> {
        let db_file = config.db_path();
        if !db_file.exists() {
            debug!("no snapshot to load: {:?}", db_file);
            return Ok(());
        }
        let file = File::open(&db_file)?;
        let loaded = self.store.write().unwrap().load(BufReader::new(file))?;
        info!("loaded {} keys from snapshot {:?}", loaded, db_file);
        Ok(())
    }
}

/// Parks on the waiter until it is signalled or the deadline passes.
/// Returns false on timeout; `None` deadline waits indefinitely.
fn wait_for_stream_event(waiter: &Arc<StreamWaiter>, deadline: Option<Instant>) -> bool {
    let (slot, signal) = &**waiter;
    let mut event = slot.lock().unwrap();
    loop {
        if event.take().is_some() {
            return true;
        }
        match deadline {
            None => {
                event = signal.wait(event).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, _) = signal.wait_timeout(event, deadline - now).unwrap();
                event = guard;
            }
        }
    }
}

fn encode_stream_record(record: &StreamRecord) -> RESP {
    let mut flat = Vec::with_capacity(record.fields.len() * 2);
    for (field, value) in &record.fields {
        flat.push(RESP::bulk(field));
        flat.push(RESP::bulk(value));
    }
    RESP::Array(vec![
        RESP::bulk(&record.id.to_string()),
        RESP::Array(flat),
    ])
}

fn parse_range_start(token: &str) -> Result<StreamEntryId> {
    if token == "-" {
        return Ok(StreamEntryId::MIN);
    }
    // a bare millisecond bound means `ms-0`
    Ok(token.parse::<StreamEntryId>()?)
}

fn parse_range_end(token: &str) -> Result<StreamEntryId> {
    if token == "+" {
        return Ok(StreamEntryId::MAX);
    }
    if token.contains('-') {
        return Ok(token.parse::<StreamEntryId>()?);
    }
    // a bare millisecond bound covers the whole millisecond
    let ms: u64 = token.parse().map_err(|_| CommandError::BadStreamId)?;
    Ok(StreamEntryId::new(ms, u64::MAX))
}

/// 40-hex replication id, generated once at boot.
fn new_replid() -> String {
    let hex = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    hex[..40].to_string()
}
