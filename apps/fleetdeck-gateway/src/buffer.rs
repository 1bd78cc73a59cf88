use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{Config, StoreBackend};
use crate::store::StoreError;

/// Bounded, TTL-limited store of recent terminal output per session.
/// Oldest entries are dropped on overflow; the whole buffer expires a fixed
/// window after the most recent write. Not an audit log.
#[async_trait]
pub trait OutputBuffer: Send + Sync {
    async fn append(&self, session_id: &str, chunk: String) -> Result<(), StoreError>;
    async fn read(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

pub async fn build_buffer(cfg: &Config) -> Arc<dyn OutputBuffer> {
    match cfg.store_backend {
        StoreBackend::Memory => Arc::new(MemoryOutputBuffer::new(
            cfg.output_max_lines,
            cfg.output_ttl,
        )),
        StoreBackend::Redis => {
            match RedisOutputBuffer::connect(&cfg.redis_url, cfg.output_max_lines, cfg.output_ttl)
                .await
            {
                Ok(buffer) => Arc::new(buffer),
                Err(err) => {
                    warn!(error = %err, "failed to connect redis output buffer; falling back to memory");
                    Arc::new(MemoryOutputBuffer::new(
                        cfg.output_max_lines,
                        cfg.output_ttl,
                    ))
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisOutputBuffer {
    redis: ConnectionManager,
    max_lines: usize,
    ttl: Duration,
}

fn output_key(session_id: &str) -> String {
    format!("session:{}:output", session_id)
}

impl RedisOutputBuffer {
    pub async fn connect(
        redis_url: &str,
        max_lines: usize,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            max_lines,
            ttl,
        })
    }
}

#[async_trait]
impl OutputBuffer for RedisOutputBuffer {
    async fn append(&self, session_id: &str, chunk: String) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = output_key(session_id);
        // Push, trim to the newest max_lines entries, refresh the expiry.
        redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(chunk)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(-(self.max_lines as isize))
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let key = output_key(session_id);
        let start = offset.min(isize::MAX as usize) as isize;
        let stop = offset
            .saturating_add(limit)
            .min(isize::MAX as usize) as isize
            - 1;
        let chunks: Vec<String> = conn.lrange(&key, start, stop).await?;
        Ok(chunks)
    }
}

/// In-memory ring buffer for tests and single-process deployments.
pub struct MemoryOutputBuffer {
    buffers: Mutex<HashMap<String, SessionBuffer>>,
    max_lines: usize,
    ttl: Duration,
}

struct SessionBuffer {
    chunks: VecDeque<String>,
    last_write: DateTime<Utc>,
}

impl MemoryOutputBuffer {
    pub fn new(max_lines: usize, ttl: Duration) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            max_lines,
            ttl,
        }
    }

    fn expired(&self, buffer: &SessionBuffer) -> bool {
        let age = Utc::now().signed_duration_since(buffer.last_write);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }
}

#[async_trait]
impl OutputBuffer for MemoryOutputBuffer {
    async fn append(&self, session_id: &str, chunk: String) -> Result<(), StoreError> {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(session_id.to_string())
            .or_insert_with(|| SessionBuffer {
                chunks: VecDeque::new(),
                last_write: Utc::now(),
            });
        if self.expired(buffer) {
            buffer.chunks.clear();
        }
        buffer.chunks.push_back(chunk);
        while buffer.chunks.len() > self.max_lines {
            buffer.chunks.pop_front();
        }
        buffer.last_write = Utc::now();
        Ok(())
    }

    async fn read(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let buffers = self.buffers.lock().await;
        let Some(buffer) = buffers.get(session_id) else {
            return Ok(Vec::new());
        };
        if self.expired(buffer) {
            return Ok(Vec::new());
        }
        Ok(buffer
            .chunks
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_the_oldest_entries() {
        let buffer = MemoryOutputBuffer::new(3, Duration::from_secs(60));
        for i in 0..5 {
            buffer.append("s1", format!("chunk-{i}")).await.unwrap();
        }
        let chunks = buffer.read("s1", 0, 10).await.unwrap();
        assert_eq!(chunks, vec!["chunk-2", "chunk-3", "chunk-4"]);
    }

    #[tokio::test]
    async fn length_never_exceeds_the_cap() {
        let buffer = MemoryOutputBuffer::new(2000, Duration::from_secs(60));
        for i in 0..2500 {
            buffer.append("s1", format!("{i}")).await.unwrap();
        }
        let chunks = buffer.read("s1", 0, usize::MAX).await.unwrap();
        assert_eq!(chunks.len(), 2000);
        assert_eq!(chunks.first().map(String::as_str), Some("500"));
        assert_eq!(chunks.last().map(String::as_str), Some("2499"));
    }

    #[tokio::test]
    async fn reads_are_range_limited_and_per_session() {
        let buffer = MemoryOutputBuffer::new(100, Duration::from_secs(60));
        for i in 0..10 {
            buffer.append("s1", format!("{i}")).await.unwrap();
        }
        buffer.append("s2", "other".to_string()).await.unwrap();

        let window = buffer.read("s1", 4, 3).await.unwrap();
        assert_eq!(window, vec!["4", "5", "6"]);
        assert_eq!(buffer.read("s2", 0, 10).await.unwrap(), vec!["other"]);
        assert!(buffer.read("s3", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_buffers_read_empty() {
        let buffer = MemoryOutputBuffer::new(100, Duration::from_millis(10));
        buffer.append("s1", "stale".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(buffer.read("s1", 0, 10).await.unwrap().is_empty());
    }
}
