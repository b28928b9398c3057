//! Ganymede is a read-through caching proxy for the RESP protocol as defined by Redis.
//!
//! # Introduction
//! **Ganymede** sits between applications speaking RESP (that is "REdis Serialization
//! Protocol") and a backing Redis instance. Clients connect to the proxy instead of the
//! upstream; reads are answered from an in-memory cache whenever possible and forwarded to
//! the upstream on a miss, with the result placed in the cache for subsequent requests.
//!
//! The cache is a *decaying* LRU: entries are evicted by recency once the configured
//! capacity is reached and additionally expire after a wall-clock TTL. Expiry is driven by
//! a background reaper which walks a time-ordered log of insertions, so that foreground
//! requests never pay for a full scan. See [cache::DecayingLruCache] for the details.
//!
//! # Features
//! * **Fast non allocating parser for RESP queries** (as sent by redis-cli and redis
//!   client libraries). The built-in server uses a single buffer per connection to read,
//!   parse and process queries. To deliver a response, a single buffer is allocated so
//!   that a reply hits the wire with one sys-call.
//! * **100% Async/Await** - the whole server builds upon [tokio](https://tokio.rs/) and
//!   async/await primitives as provided by Rust. The command handlers are built as actors
//!   to simplify concurrency correctness and to minimize synchronization overheads.
//! * **Bounded staleness** - a cached reply is served for at most the configured TTL;
//!   afterwards the next request falls through to the upstream again.
//! * **Small and well documented code base**. Ganymede stands on the shoulders of giants
//!   (especially [tokio](https://tokio.rs/)) and therefore remains small enough to be read
//!   and understood in one sitting.
//!
//! # Anatomy
//! * [request] / [response] parse inbound command frames and render replies.
//! * [cache] contains the decaying LRU cache along with its reaper.
//! * [commands] provides the dictionary and dispatcher which route a parsed request to
//!   the actor responsible for it.
//! * [proxy] registers the actual proxy commands (**GET** and **PING**) and coordinates
//!   cache lookups with upstream fallback.
//! * [upstream] is the narrow adapter onto the backing Redis instance.
//! * [server] accepts client connections and runs the per-connection protocol loop.
//! * [platform], [builder], [config] and [signals] wire everything together.
//!
//! # Using Ganymede
//! The accompanying binary (**ganymede-io**) is a complete proxy. Embedding the library
//! in a custom setup is a matter of a few lines:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ganymede::builder::Builder;
//! use ganymede::cache::DecayingLruCache;
//! use ganymede::proxy::{self, ReplyCache};
//! use ganymede::server::Server;
//! use ganymede::upstream::RedisUpstream;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     let upstream = RedisUpstream::connect("localhost:6379", "", 0).await?;
//!     let cache: Arc<ReplyCache> = Arc::new(DecayingLruCache::new(
//!         1024,
//!         Duration::from_millis(100),
//!         Duration::from_secs(300),
//!     )?);
//!
//!     platform.register::<ReplyCache>(cache.clone());
//!     proxy::install(platform.clone(), cache, upstream);
//!
//!     platform.require::<Server>().run().await
//! }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod commands;
pub mod config;
pub mod platform;
pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod signals;
pub mod upstream;

/// Contains the version of the ganymede library.
pub const GANYMEDE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set
/// up the proxy, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Integration tests fork several platforms within one process, therefore the logging
    // system must only ever be initialized once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use redis::{Connection, RedisError};
    use tokio::time::Duration;

    use crate::upstream::Upstream;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is either our test port (1503) on which we start a local
        /// server for integration tests or the mocked clock used by the cache tests.
        /// Using this lock, we can still execute all other tests in parallel and only
        /// block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query against the test server in an async fashion.
    ///
    /// This is required as we must not block tokio in any way. We deliberately use the
    /// blocking client here, as each query then exercises a fresh connection - just like
    /// the shortest lived real world client would.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open("redis://127.0.0.1:1503").unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }

    /// Provides an in-memory stand-in for the backing Redis instance.
    ///
    /// The map of values is shared, so that a test can change the upstream state while
    /// the proxy is running (e.g. to prove that cached replies stay stable).
    #[derive(Clone)]
    pub struct MockUpstream {
        values: Arc<Mutex<HashMap<String, Bytes>>>,
    }

    impl MockUpstream {
        /// Creates a mock upstream pre-seeded with the given key/value pairs.
        pub fn seeded(values: &[(&str, &str)]) -> Self {
            let map = values
                .iter()
                .map(|(key, value)| ((*key).to_owned(), Bytes::copy_from_slice(value.as_bytes())))
                .collect();

            MockUpstream {
                values: Arc::new(Mutex::new(map)),
            }
        }

        /// Stores or replaces a value, emulating a write to the backing instance.
        pub fn put(&self, key: &str, value: &str) {
            let _ = self
                .values
                .lock()
                .unwrap()
                .insert(key.to_owned(), Bytes::copy_from_slice(value.as_bytes()));
        }

        /// Deletes a value, emulating a removal from the backing instance.
        pub fn delete(&self, key: &str) {
            let _ = self.values.lock().unwrap().remove(key);
        }
    }

    impl Upstream for MockUpstream {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn ping(&self) -> anyhow::Result<String> {
            Ok("PONG".to_owned())
        }
    }
}
