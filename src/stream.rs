use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::CommandError;

/// `ms-seq` pair identifying a record within a stream. Ordering is the
/// numeric-pair lexicographic order, so derived `Ord` is the wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamEntryId(pub u64, pub u64);

impl StreamEntryId {
    pub const MIN: Self = Self(0, 0);
    pub const MAX: Self = Self(u64::MAX, u64::MAX);

    pub fn new(time_id: u64, seq_id: u64) -> Self {
        Self(time_id, seq_id)
    }

    /// Resolves the `*` and `ms-*` XADD forms against the stream's last id.
    pub fn generate(pattern: &str, last_id: Option<StreamEntryId>) -> Result<Self, CommandError> {
        if pattern == "*" {
            let now = unix_millis();
            return Ok(match last_id {
                // clock went backwards or several adds landed in one milli
                Some(StreamEntryId(last_ms, last_seq)) if last_ms >= now => {
                    Self(last_ms, last_seq + 1)
                }
                _ => Self(now, 0),
            });
        }
        match pattern.strip_suffix("-*") {
            Some(time_part) => {
                let time_id: u64 = time_part.parse().map_err(|_| CommandError::BadStreamId)?;
                if time_id == 0 && last_id.is_none() {
                    return Err(CommandError::StreamIdZero);
                }
                let seq_id = match last_id {
                    Some(StreamEntryId(last_ms, last_seq)) if last_ms == time_id => last_seq + 1,
                    _ => 0,
                };
                Ok(Self(time_id, seq_id))
            }
            None => Err(CommandError::BadStreamId),
        }
    }
}

impl FromStr for StreamEntryId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((first, second)) => Ok(Self(
                first.parse().map_err(|_| CommandError::BadStreamId)?,
                second.parse().map_err(|_| CommandError::BadStreamId)?,
            )),
            None => Ok(Self(s.parse().map_err(|_| CommandError::BadStreamId)?, 0)),
        }
    }
}

impl Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamEntryId,
    pub fields: Vec<(String, String)>,
}

/// Ordered record log for one stream key.
#[derive(Default)]
pub struct Stream {
    records: Vec<StreamRecord>,
}

impl Stream {
    /// Appends one record, resolving pattern ids. The id must come out
    /// strictly greater than the current tail.
    pub fn append(
        &mut self,
        id_pattern: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamEntryId, CommandError> {
        let new_id = if id_pattern.contains('*') {
            StreamEntryId::generate(id_pattern, self.last_id())?
        } else {
            id_pattern.parse()?
        };

        if new_id <= StreamEntryId::MIN {
            return Err(CommandError::StreamIdZero);
        }
        if let Some(last_id) = self.last_id() {
            if new_id <= last_id {
                return Err(CommandError::StreamIdTooSmall);
            }
        }

        self.records.push(StreamRecord { id: new_id, fields });
        Ok(new_id)
    }

    pub fn last_id(&self) -> Option<StreamEntryId> {
        self.records.last().map(|r| r.id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records with `from <= id <= to`.
    pub fn range(&self, from: StreamEntryId, to: StreamEntryId) -> Vec<StreamRecord> {
        self.records
            .iter()
            .filter(|r| r.id >= from && r.id <= to)
            .cloned()
            .collect()
    }

    /// All records strictly after `after`.
    pub fn after(&self, after: StreamEntryId) -> Vec<StreamRecord> {
        self.records.iter().filter(|r| r.id > after).cloned().collect()
    }
}

/// Signal delivered to a blocked XREAD when a listed stream grows.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub key: String,
    pub id: StreamEntryId,
}

/// Completion slot a blocked reader parks on; XADD fills it and notifies.
pub type StreamWaiter = (Mutex<Option<StreamEvent>>, Condvar);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
