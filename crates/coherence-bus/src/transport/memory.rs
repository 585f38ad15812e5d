//! In-process stream transport.
//!
//! Keeps every stream as a capped `VecDeque` and every consumer group as a
//! delivery cursor plus a pending set. Blocking reads park on a
//! [`Notify`] that every append wakes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{StreamEntry, StreamTransport};
use crate::error::TransportError;

#[derive(Debug)]
struct StoredEntry {
    seq: u64,
    entry: StreamEntry,
}

#[derive(Debug, Default)]
struct GroupCursor {
    last_delivered: u64,
    /// seq -> consumer that received it
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    entries: VecDeque<StoredEntry>,
    last_seq: u64,
    groups: HashMap<String, GroupCursor>,
}

/// Capped in-memory streams with consumer groups.
#[derive(Debug, Default)]
pub struct InMemoryStreamTransport {
    streams: Mutex<HashMap<String, MemoryStream>>,
    appended: Notify,
    offline: AtomicBool,
    fail_appends: AtomicU32,
    fail_acks: AtomicU32,
    append_calls: AtomicU64,
}

impl InMemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: while offline every operation fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fault injection: fail the next `n` appends.
    pub fn fail_next_appends(&self, n: u32) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Fault injection: fail the next `n` acks. Failed acks leave entries pending.
    pub fn fail_next_acks(&self, n: u32) {
        self.fail_acks.store(n, Ordering::SeqCst);
    }

    /// Number of times `append` has been invoked, including failed calls.
    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Entries pending acknowledgement for `group`.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn check_online(&self, command: &'static str) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::CommandFailed {
                command,
                reason: "transport offline".into(),
            });
        }
        Ok(())
    }

    fn take_injected_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_id(seq: u64) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{millis}-{seq}")
    }

    fn parse_seq(id: &str) -> Option<u64> {
        id.rsplit_once('-')?.1.parse().ok()
    }

    /// Deliver new entries to `group`, or `None` if there are none yet.
    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>, TransportError> {
        let no_group = || TransportError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };

        let mut streams = self.streams.lock();
        let log = streams.get_mut(stream).ok_or_else(no_group)?;
        let cursor = log.groups.get_mut(group).ok_or_else(no_group)?;

        let batch: Vec<&StoredEntry> = log
            .entries
            .iter()
            .filter(|stored| stored.seq > cursor.last_delivered)
            .take(count.max(1))
            .collect();
        if batch.is_empty() {
            return Ok(None);
        }

        let mut delivered = Vec::with_capacity(batch.len());
        for stored in batch {
            cursor.last_delivered = stored.seq;
            cursor.pending.insert(stored.seq, consumer.to_string());
            delivered.push(stored.entry.clone());
        }
        Ok(Some(delivered))
    }
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.check_online("PING")
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, TransportError> {
        self.check_online("XGROUP CREATE")?;
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        log.groups.insert(group.to_string(), GroupCursor::default());
        debug!(stream, group, "Consumer group created");
        Ok(true)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, TransportError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online("XADD")?;
        if Self::take_injected_failure(&self.fail_appends) {
            return Err(TransportError::CommandFailed {
                command: "XADD",
                reason: "injected failure".into(),
            });
        }

        let id = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            log.last_seq += 1;
            let seq = log.last_seq;
            let id = Self::next_id(seq);
            log.entries.push_back(StoredEntry {
                seq,
                entry: StreamEntry {
                    id: id.clone(),
                    fields: fields.iter().cloned().collect(),
                },
            });
            while log.entries.len() > max_len.max(1) {
                log.entries.pop_front();
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_online("XREADGROUP")?;
            if let Some(entries) = self.try_deliver(stream, group, consumer, count)? {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError> {
        self.check_online("XACK")?;
        if Self::take_injected_failure(&self.fail_acks) {
            return Err(TransportError::CommandFailed {
                command: "XACK",
                reason: "injected failure".into(),
            });
        }
        let mut streams = self.streams.lock();
        let Some(cursor) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(|id| Self::parse_seq(id))
            .filter(|seq| cursor.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>, TransportError> {
        self.check_online("XRANGE")?;
        let streams = self.streams.lock();
        Ok(streams
            .get(stream)
            .map(|log| log.entries.iter().map(|s| s.entry.clone()).collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("In-memory transport closed");
        Ok(())
    }
}
