use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::debug;

use crate::errors::CommandError;
use crate::protocol::rdb;
use crate::stream::{Stream, StreamEntryId, StreamEvent, StreamRecord, StreamWaiter};

enum Value {
    String(String),
    Stream(Stream),
}

struct StoredValue {
    value: Value,
    valid_until: Option<Instant>,
}

impl StoredValue {
    fn from_string(value: &str, valid_until: Option<Instant>) -> Self {
        StoredValue {
            value: Value::String(value.to_string()),
            valid_until,
        }
    }

    /// Live means no deadline, or the deadline is still strictly ahead.
    fn is_live(&self) -> bool {
        self.valid_until.map_or(true, |deadline| Instant::now() < deadline)
    }

    fn value(&self) -> Option<&str> {
        if !self.is_live() {
            return None;
        }
        match &self.value {
            Value::String(value) => Some(value),
            Value::Stream(_) => None,
        }
    }

    fn value_type(&self) -> &'static str {
        match &self.value {
            Value::String(_) => {
                if self.is_live() {
                    "string"
                } else {
                    "none"
                }
            }
            Value::Stream(_) => "stream",
        }
    }
}

/// The keyspace: string and stream entries plus the registry of blocked
/// stream readers. Callers go through one `RwLock` around the whole store.
pub struct KVStore {
    values: HashMap<String, StoredValue>,
    waiters: HashMap<String, Vec<Weak<StreamWaiter>>>,
}

impl KVStore {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        self.values.get(key).and_then(|v| v.value()).map(str::to_string)
    }

    pub fn insert_value(&mut self, key: &str, value: &str, expiration: Option<Duration>) {
        let valid_until = expiration.map(|d| Instant::now() + d);
        self.values
            .insert(key.to_string(), StoredValue::from_string(value, valid_until));
    }

    /// INCR: a missing or expired key becomes `"1"`; a live integer is
    /// bumped in place, keeping whatever deadline it had.
    pub fn increment(&mut self, key: &str) -> Result<i64, CommandError> {
        match self.values.get_mut(key) {
            Some(stored) if stored.is_live() => match &mut stored.value {
                Value::String(value) => {
                    let number: i64 = value.parse().map_err(|_| CommandError::NotInteger)?;
                    let number = number.checked_add(1).ok_or(CommandError::NotInteger)?;
                    *value = number.to_string();
                    Ok(number)
                }
                Value::Stream(_) => Err(CommandError::WrongType),
            },
            _ => {
                self.values
                    .insert(key.to_string(), StoredValue::from_string("1", None));
                Ok(1)
            }
        }
    }

    /// Removes a key of any domain; expired entries count as absent.
    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).map_or(false, |v| v.is_live())
    }

    pub fn get_type(&self, key: &str) -> &'static str {
        self.values.get(key).map_or("none", |v| v.value_type())
    }

    /// All live string keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(_, v)| matches!(v.value, Value::String(_)) && v.is_live())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// XADD: appends to the stream (creating it if needed), then signals
    /// every reader blocked on this key.
    pub fn append_stream(
        &mut self,
        key: &str,
        id_pattern: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamEntryId> {
        let stored = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                value: Value::Stream(Stream::default()),
                valid_until: None,
            });
        let Value::Stream(stream) = &mut stored.value else {
            return Err(CommandError::WrongType.into());
        };
        let new_id = stream.append(id_pattern, fields)?;
        self.notify_stream_waiters(key, new_id);
        Ok(new_id)
    }

    pub fn range_stream(&self, key: &str, from: StreamEntryId, to: StreamEntryId) -> Vec<StreamRecord> {
        match self.values.get(key) {
            Some(StoredValue {
                value: Value::Stream(stream),
                ..
            }) => stream.range(from, to),
            _ => vec![],
        }
    }

    pub fn read_stream_after(&self, key: &str, after: StreamEntryId) -> Vec<StreamRecord> {
        match self.values.get(key) {
            Some(StoredValue {
                value: Value::Stream(stream),
                ..
            }) => stream.after(after),
            _ => vec![],
        }
    }

    /// Current tail id; `0-0` for a missing stream so that any new record
    /// qualifies as "after the tail".
    pub fn last_stream_id(&self, key: &str) -> StreamEntryId {
        match self.values.get(key) {
            Some(StoredValue {
                value: Value::Stream(stream),
                ..
            }) => stream.last_id().unwrap_or(StreamEntryId::MIN),
            _ => StreamEntryId::MIN,
        }
    }

    /// Registers a blocked reader on each listed key. Waiters are weak;
    /// dropped readers are pruned on the next notification.
    pub fn add_stream_waiter(&mut self, keys: &[String], waiter: &Arc<StreamWaiter>) {
        for key in keys {
            self.waiters
                .entry(key.clone())
                .or_default()
                .push(Arc::downgrade(waiter));
        }
    }

    fn notify_stream_waiters(&mut self, key: &str, id: StreamEntryId) {
        let Some(waiters) = self.waiters.get_mut(key) else {
            return;
        };
        waiters.retain(|weak| match weak.upgrade() {
            Some(waiter) => {
                let (slot, signal) = &*waiter;
                slot.lock().unwrap().replace(StreamEvent {
                    key: key.to_string(),
                    id,
                });
                signal.notify_one();
                true
            }
            None => false,
        });
        if waiters.is_empty() {
            self.waiters.remove(key);
        }
    }

    /// Loads the string keyspace of an RDB image; entries already expired
    /// at load time are dropped.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<usize> {
        let now = SystemTime::now();
        let mut loaded = 0;
        for entry in rdb::read_snapshot(reader)? {
            let valid_until = match entry.expires_at_ms {
                Some(epoch_ms) => {
                    let deadline = UNIX_EPOCH + Duration::from_millis(epoch_ms);
                    match deadline.duration_since(now) {
                        Ok(remaining) => Some(Instant::now() + remaining),
                        Err(_) => {
                            debug!("skipping expired snapshot key: {}", entry.key);
                            continue;
                        }
                    }
                }
                None => None,
            };
            self.values
                .insert(entry.key, StoredValue::from_string(&entry.value, valid_until));
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for KVStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn fields() -> Vec<(String, String)> {
        vec![("f".to_string(), "v".to_string())]
    }

    #[test]
    fn set_then_get() {
        let mut store = KVStore::new();
        store.insert_value("k", "v", None);
        assert_eq!(store.get_value("k"), Some("v".to_string()));
        assert_eq!(store.get_value("missing"), None);
    }

    #[test]
    fn entries_expire_after_their_deadline() {
        let mut store = KVStore::new();
        store.insert_value("k", "v", Some(Duration::from_millis(40)));
        assert_eq!(store.get_value("k"), Some("v".to_string()));
        assert_eq!(store.get_type("k"), "string");
        thread::sleep(Duration::from_millis(60));
        assert_eq!(store.get_value("k"), None);
        assert_eq!(store.get_type("k"), "none");
        assert!(store.keys().is_empty());
        assert!(!store.remove("k"));
    }

    #[test]
    fn overwrite_resets_expiry() {
        let mut store = KVStore::new();
        store.insert_value("k", "v1", Some(Duration::from_millis(30)));
        store.insert_value("k", "v2", None);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(store.get_value("k"), Some("v2".to_string()));
    }

    #[test]
    fn increment_creates_and_counts() {
        let mut store = KVStore::new();
        assert_eq!(store.increment("n"), Ok(1));
        assert_eq!(store.increment("n"), Ok(2));
        assert_eq!(store.get_value("n"), Some("2".to_string()));
    }

    #[test]
    fn increment_rejects_non_integers_and_overflow() {
        let mut store = KVStore::new();
        store.insert_value("s", "abc", None);
        assert_eq!(store.increment("s"), Err(CommandError::NotInteger));
        // the failure leaves the value untouched
        assert_eq!(store.get_value("s"), Some("abc".to_string()));

        store.insert_value("max", &i64::MAX.to_string(), None);
        assert_eq!(store.increment("max"), Err(CommandError::NotInteger));
    }

    #[test]
    fn increment_keeps_the_existing_deadline() {
        let mut store = KVStore::new();
        store.insert_value("n", "1", Some(Duration::from_millis(40)));
        assert_eq!(store.increment("n"), Ok(2));
        thread::sleep(Duration::from_millis(60));
        // deadline survived the increment
        assert_eq!(store.get_value("n"), None);
    }

    #[test]
    fn keys_lists_only_live_strings() {
        let mut store = KVStore::new();
        store.insert_value("a", "1", None);
        store.append_stream("s", "1-1", fields()).unwrap();
        let keys = store.keys();
        assert_eq!(keys, vec!["a".to_string()]);
    }

    #[test]
    fn type_distinguishes_domains() {
        let mut store = KVStore::new();
        store.insert_value("str", "v", None);
        store.append_stream("stm", "1-1", fields()).unwrap();
        assert_eq!(store.get_type("str"), "string");
        assert_eq!(store.get_type("stm"), "stream");
        assert_eq!(store.get_type("nope"), "none");
    }

    #[test]
    fn a_key_has_one_domain() {
        let mut store = KVStore::new();
        store.insert_value("k", "v", None);
        assert!(store.append_stream("k", "1-1", fields()).is_err());
    }

    #[test]
    fn stream_waiters_are_signalled_on_append() {
        let mut store = KVStore::new();
        let waiter: Arc<StreamWaiter> = Arc::new((std::sync::Mutex::new(None), std::sync::Condvar::new()));
        store.add_stream_waiter(&["s".to_string()], &waiter);
        store.append_stream("s", "3-1", fields()).unwrap();
        let event = waiter.0.lock().unwrap().take().unwrap();
        assert_eq!(event.key, "s");
        assert_eq!(event.id, StreamEntryId(3, 1));
    }

    #[test]
    fn dropped_waiters_are_pruned() {
        let mut store = KVStore::new();
        let waiter: Arc<StreamWaiter> = Arc::new((std::sync::Mutex::new(None), std::sync::Condvar::new()));
        store.add_stream_waiter(&["s".to_string()], &waiter);
        drop(waiter);
        store.append_stream("s", "1-1", fields()).unwrap();
        assert!(store.waiters.is_empty());
    }

    #[test]
    fn load_round_trips_snapshot_strings() {
        let mut store = KVStore::new();
        let loaded = store.load(rdb::empty_rdb().as_ref()).unwrap();
        assert_eq!(loaded, 0);
    }
}
