//! Redis Streams transport.
//!
//! Shared commands (XADD, XACK, XRANGE, XGROUP) go through one
//! [`ConnectionManager`], which reconnects on its own. Each consumer gets a
//! dedicated multiplexed connection for `XREADGROUP ... BLOCK` so a parked
//! read never stalls publishers. Multiplexed connections do not reconnect,
//! so a read that fails at the connection level drops its connection and the
//! next poll opens a fresh one.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{Client, Cmd, RedisError};
use tracing::{debug, info, warn};

use super::{StreamEntry, StreamTransport};
use crate::error::TransportError;

/// Time allowed beyond the `BLOCK` window before a read counts as hung.
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Time allowed to establish a dedicated read connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Dedicated read connections keyed by consumer name.
struct ReaderPool<C> {
    conns: Mutex<HashMap<String, C>>,
}

impl<C: Clone> ReaderPool<C> {
    fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Cached connection for `consumer`, opening one with `open` if absent.
    async fn get_or_open<F, Fut>(&self, consumer: &str, open: F) -> Result<C, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, TransportError>>,
    {
        if let Some(conn) = self.conns.lock().get(consumer) {
            return Ok(conn.clone());
        }
        let conn = open().await?;
        debug!(consumer, "Opened dedicated read connection");
        Ok(self
            .conns
            .lock()
            .entry(consumer.to_string())
            .or_insert(conn)
            .clone())
    }

    /// Drop the connection of `consumer` if `err` means it is unusable.
    fn evict_on(&self, consumer: &str, err: &TransportError) -> bool {
        if !matches!(err, TransportError::ConnectionFailed(_)) {
            return false;
        }
        let evicted = self.conns.lock().remove(consumer).is_some();
        if evicted {
            warn!(consumer, error = %err, "Dropped broken read connection");
        }
        evicted
    }

    fn clear(&self) -> usize {
        let mut conns = self.conns.lock();
        let n = conns.len();
        conns.clear();
        n
    }

    fn len(&self) -> usize {
        self.conns.lock().len()
    }
}

/// Redis Streams backend.
pub struct RedisStreamTransport {
    client: Client,
    manager: ConnectionManager,
    readers: ReaderPool<MultiplexedConnection>,
}

impl RedisStreamTransport {
    /// Open a client for `url` and establish the shared connection.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!(url = %redact(url), "Connected to Redis");
        Ok(Self {
            client,
            manager,
            readers: ReaderPool::new(),
        })
    }

    async fn reader(
        &self,
        consumer: &str,
        block: Duration,
    ) -> Result<MultiplexedConnection, TransportError> {
        self.readers
            .get_or_open(consumer, || async {
                self.client
                    .get_multiplexed_async_connection_with_timeouts(
                        block + READ_TIMEOUT_MARGIN,
                        CONNECT_TIMEOUT,
                    )
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
            })
            .await
    }
}

impl std::fmt::Debug for RedisStreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamTransport")
            .field("readers", &self.readers.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| classify("PING", e))?;
        if reply != "PONG" {
            return Err(TransportError::UnexpectedReply {
                command: "PING",
                reason: reply,
            });
        }
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<bool, TransportError> {
        let mut conn = self.manager.clone();
        let result: Result<String, RedisError> =
            xgroup_create_cmd(stream, group).query_async(&mut conn).await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_busy_group(&e) => Ok(false),
            Err(e) => Err(classify("XGROUP CREATE", e)),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<String, TransportError> {
        let mut conn = self.manager.clone();
        xadd_cmd(stream, fields, max_len)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify("XADD", e))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut conn = self.reader(consumer, block).await?;
        let reply: Option<StreamReadReply> = xreadgroup_cmd(stream, group, consumer, count, block)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                let err = classify_group("XREADGROUP", stream, group, e);
                self.readers.evict_on(consumer, &err);
                err
            })?;

        let ids = reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default();
        entries_from_ids(ids)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, TransportError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id);
        }
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| classify("XACK", e))
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>, TransportError> {
        let mut conn = self.manager.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(|e| classify("XRANGE", e))?;
        entries_from_ids(reply.ids)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let dropped = self.readers.clear();
        info!(readers = dropped, "Redis transport closed");
        Ok(())
    }
}

fn xgroup_create_cmd(stream: &str, group: &str) -> Cmd {
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
    cmd
}

fn xadd_cmd(stream: &str, fields: &[(String, String)], max_len: usize) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    // Exact trimming, no `~`: the bound is a hard cap
    cmd.arg(stream).arg("MAXLEN").arg(max_len).arg("*");
    for (key, value) in fields {
        cmd.arg(key).arg(value);
    }
    cmd
}

fn xreadgroup_cmd(stream: &str, group: &str, consumer: &str, count: usize, block: Duration) -> Cmd {
    let mut cmd = redis::cmd("XREADGROUP");
    cmd.arg("GROUP")
        .arg(group)
        .arg(consumer)
        .arg("COUNT")
        .arg(count)
        .arg("BLOCK")
        .arg(block.as_millis() as u64)
        .arg("STREAMS")
        .arg(stream)
        .arg(">");
    cmd
}

fn entries_from_ids(ids: Vec<StreamId>) -> Result<Vec<StreamEntry>, TransportError> {
    ids.into_iter()
        .map(|entry| {
            let fields = entry
                .map
                .iter()
                .map(|(key, value)| {
                    redis::from_redis_value::<String>(value)
                        .map(|value| (key.clone(), value))
                        .map_err(|e| TransportError::UnexpectedReply {
                            command: "XREADGROUP",
                            reason: format!("field {key}: {e}"),
                        })
                })
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(StreamEntry {
                id: entry.id,
                fields,
            })
        })
        .collect()
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

fn classify(command: &'static str, err: RedisError) -> TransportError {
    if err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
    {
        TransportError::ConnectionFailed(err.to_string())
    } else {
        TransportError::CommandFailed {
            command,
            reason: err.to_string(),
        }
    }
}

fn classify_group(command: &'static str, stream: &str, group: &str, err: RedisError) -> TransportError {
    if err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP") {
        TransportError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        classify(command, err)
    }
}

/// Strip credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}
