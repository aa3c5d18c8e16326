//! Non-authoritative sandbox → address cache.
//!
//! The backend is chosen once at startup. If the remote store cannot be
//! reached within the connect timeout the process runs with [`NullCache`]
//! for the rest of its life.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::models::{ContainerAddress, SandboxId};

/// Cache operations never fail from the caller's point of view: a broken
/// backend reads as a miss and swallows writes.
#[async_trait]
pub trait AddressCache: Send + Sync + 'static {
    async fn get(&self, id: &SandboxId) -> Option<ContainerAddress>;
    async fn set(&self, id: &SandboxId, address: ContainerAddress);
    async fn invalidate(&self, id: &SandboxId);
    fn is_connected(&self) -> bool;
}

/// Redis-backed cache. Entries have no expiry. Every command is bounded
/// by the same timeout as the initial connect.
pub struct RedisCache {
    conn: MultiplexedConnection,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, String> {
        let client = redis::Client::open(url).map_err(|e| e.to_string())?;
        let conn = timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| format!("timed out after {connect_timeout:?}"))?
            .map_err(|e| e.to_string())?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
            op_timeout: connect_timeout,
        })
    }

    fn key(&self, id: &SandboxId) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

#[async_trait]
impl AddressCache for RedisCache {
    async fn get(&self, id: &SandboxId) -> Option<ContainerAddress> {
        let mut conn = self.conn.clone();
        let reply = timeout(self.op_timeout, conn.get::<_, Option<String>>(self.key(id))).await;
        let Ok(reply) = reply else {
            warn!(sandbox = %id, timeout = ?self.op_timeout, "cache read timed out");
            return None;
        };
        match reply {
            Ok(Some(raw)) => match raw.parse() {
                Ok(address) => Some(address),
                Err(_) => {
                    debug!(sandbox = %id, value = %raw, "ignoring unparsable cache value");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(sandbox = %id, %err, "cache read failed");
                None
            }
        }
    }

    async fn set(&self, id: &SandboxId, address: ContainerAddress) {
        let mut conn = self.conn.clone();
        match timeout(
            self.op_timeout,
            conn.set::<_, _, ()>(self.key(id), address.to_string()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(sandbox = %id, %err, "cache write failed"),
            Err(_) => warn!(sandbox = %id, timeout = ?self.op_timeout, "cache write timed out"),
        }
    }

    async fn invalidate(&self, id: &SandboxId) {
        let mut conn = self.conn.clone();
        match timeout(self.op_timeout, conn.del::<_, ()>(self.key(id))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(sandbox = %id, %err, "cache delete failed"),
            Err(_) => warn!(sandbox = %id, timeout = ?self.op_timeout, "cache delete timed out"),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Stand-in used when no cache is reachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCache;

#[async_trait]
impl AddressCache for NullCache {
    async fn get(&self, _id: &SandboxId) -> Option<ContainerAddress> {
        None
    }

    async fn set(&self, _id: &SandboxId, _address: ContainerAddress) {}

    async fn invalidate(&self, _id: &SandboxId) {}

    fn is_connected(&self) -> bool {
        false
    }
}

/// In-process cache, for tests and single-node setups without Redis.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<SandboxId, ContainerAddress>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AddressCache for MemoryCache {
    async fn get(&self, id: &SandboxId) -> Option<ContainerAddress> {
        self.entries.get(id).map(|entry| *entry)
    }

    async fn set(&self, id: &SandboxId, address: ContainerAddress) {
        self.entries.insert(id.clone(), address);
    }

    async fn invalidate(&self, id: &SandboxId) {
        self.entries.remove(id);
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Picks the cache backend. `None`, an empty URL or `none` selects
/// [`NullCache`] without trying to connect.
pub async fn connect_cache(
    url: Option<&str>,
    key_prefix: &str,
    connect_timeout: Duration,
) -> Arc<dyn AddressCache> {
    let url = match url.map(str::trim) {
        Some(url) if !url.is_empty() && !url.eq_ignore_ascii_case("none") => url,
        _ => {
            info!("address cache disabled");
            return Arc::new(NullCache);
        }
    };

    match RedisCache::connect(url, key_prefix, connect_timeout).await {
        Ok(cache) => {
            info!(%url, "address cache connected");
            Arc::new(cache)
        }
        Err(err) => {
            warn!(%url, %err, "address cache unavailable, falling back to direct platform queries");
            Arc::new(NullCache)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(raw: &str) -> SandboxId {
        SandboxId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn null_cache_is_always_empty() {
        let cache = NullCache;
        cache.set(&id("alice"), Ipv4Addr::new(10, 0, 3, 5).into()).await;
        assert_eq!(cache.get(&id("alice")).await, None);
        assert!(!cache.is_connected());
    }

    #[tokio::test]
    async fn memory_cache_overwrites_and_invalidates() {
        let cache = MemoryCache::new();
        cache.set(&id("alice"), Ipv4Addr::new(10, 0, 3, 5).into()).await;
        cache.set(&id("alice"), Ipv4Addr::new(10, 0, 3, 6).into()).await;
        assert_eq!(
            cache.get(&id("alice")).await,
            Some(Ipv4Addr::new(10, 0, 3, 6).into())
        );
        cache.invalidate(&id("alice")).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn disabled_url_selects_null_cache() {
        let cache = connect_cache(Some("none"), "agent:", Duration::from_millis(50)).await;
        assert!(!cache.is_connected());
        let cache = connect_cache(None, "agent:", Duration::from_millis(50)).await;
        assert!(!cache.is_connected());
    }

    /// Answers the client handshake with `+OK` and never replies again once
    /// a `GET` arrives.
    async fn stalling_redis() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut stalled = false;
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let chunk = &buf[..n];
                stalled |= chunk.windows(3).any(|w| w == b"GET");
                if stalled {
                    continue;
                }
                let commands = chunk.iter().filter(|b| **b == b'*').count();
                for _ in 0..commands {
                    stream.write_all(b"+OK\r\n").await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn silent_backend_reads_as_miss() {
        let addr = stalling_redis().await;
        let cache = RedisCache::connect(
            &format!("redis://{addr}"),
            "agent:",
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), cache.get(&id("alice")))
            .await
            .expect("get must not hang on a silent backend");
        assert_eq!(result, None);
        assert!(started.elapsed() < Duration::from_secs(3));

        tokio::time::timeout(
            Duration::from_secs(5),
            cache.set(&id("alice"), Ipv4Addr::new(10, 0, 3, 5).into()),
        )
        .await
        .expect("set must not hang on a silent backend");
    }

    #[tokio::test]
    async fn unreachable_backend_falls_back() {
        // Port 1 on loopback refuses connections.
        let cache = connect_cache(
            Some("redis://127.0.0.1:1"),
            "agent:",
            Duration::from_millis(500),
        )
        .await;
        assert!(!cache.is_connected());
        assert_eq!(cache.get(&id("alice")).await, None);
    }
}
