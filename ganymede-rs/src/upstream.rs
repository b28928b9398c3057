//! Provides the narrow adapter onto the backing Redis instance.
//!
//! The proxy consumes exactly two operations of the upstream: a key lookup and a
//! liveness probe. Both are captured in the [Upstream](Upstream) trait, so that tests
//! can substitute an in-memory fake and the proxy actor stays independent of the
//! concrete client library.
//!
//! [RedisUpstream](RedisUpstream) is the production implementation. It speaks to the
//! upstream through a managed connection (see `redis::aio::ConnectionManager`) which
//! transparently reconnects after transient failures, so a hiccup of the backing
//! instance degrades into cache-miss errors instead of a dead proxy.
use std::future::Future;

use anyhow::Context;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Enumerates the upstream operations the proxy relies on.
///
/// The returned futures are required to be **Send** as they are awaited inside the
/// proxy actor's task.
pub trait Upstream: Send + Sync + 'static {
    /// Fetches the value stored for the given key.
    ///
    /// Returns `Ok(None)` if the upstream doesn't know the key. An **Err** indicates a
    /// transport problem; the caller treats both cases as "nothing to serve".
    fn get(&self, key: &str) -> impl Future<Output = anyhow::Result<Option<Bytes>>> + Send;

    /// Probes the upstream for liveness and returns its answer.
    ///
    /// This is executed once during startup - a proxy in front of an unreachable
    /// upstream would only ever serve nil replies, which is better discovered early.
    fn ping(&self) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Talks to a real Redis instance.
pub struct RedisUpstream {
    connection: ConnectionManager,
}

impl RedisUpstream {
    /// Connects to the Redis instance at the given address.
    ///
    /// The address has the common `host:port` form; **password** may be empty and
    /// **database** selects the logical database index (0 being the default).
    pub async fn connect(address: &str, password: &str, database: i64) -> anyhow::Result<Self> {
        let url = RedisUpstream::connection_url(address, password, database);
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("Invalid upstream address: {}", address))?;
        let connection = client
            .get_connection_manager()
            .await
            .with_context(|| format!("Failed to connect to the upstream at {}", address))?;

        Ok(RedisUpstream { connection })
    }

    /// Renders the connection URL for the given coordinates.
    fn connection_url(address: &str, password: &str, database: i64) -> String {
        if password.is_empty() {
            format!("redis://{}/{}", address, database)
        } else {
            format!("redis://:{}@{}/{}", password, address, database)
        }
    }
}

impl Upstream for RedisUpstream {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection
            .get(key)
            .await
            .with_context(|| format!("Upstream lookup for {} failed", key))?;

        Ok(value.map(Bytes::from))
    }

    async fn ping(&self) -> anyhow::Result<String> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .context("The upstream did not answer a PING")
    }
}

#[cfg(test)]
mod tests {
    use crate::upstream::RedisUpstream;

    #[test]
    fn connection_urls_are_rendered_correctly() {
        assert_eq!(
            RedisUpstream::connection_url("localhost:6379", "", 0),
            "redis://localhost:6379/0"
        );
        assert_eq!(
            RedisUpstream::connection_url("redis.internal:6380", "hunter2", 3),
            "redis://:hunter2@redis.internal:6380/3"
        );
    }
}
