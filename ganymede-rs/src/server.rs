//! Contains the server component of the proxy.
//!
//! Opens a server socket on the configured port (**server.port** in the config or 8001
//! as fallback) and binds it to the selected IP (**server.host** in the config or
//! 0.0.0.0 as fallback). Each incoming client is expected to send RESP command frames
//! and will be provided with the appropriate replies.
//!
//! Binding the socket is all-or-nothing: if the address is taken, [Server::run] reports
//! an error and the process exits, so that a supervisor can restart the proxy with a
//! clean slate. Once the socket is bound, the cache reaper is started; it is shut down
//! again when the accept loop winds down.
//!
//! Each accepted connection is served by its own task which reads, parses, dispatches
//! and replies until the peer closes the connection. A malformed frame is logged and
//! skipped without a reply - the connection stays open, matching the original proxy's
//! lenient behavior towards buggy clients.
//!
//! # Example
//!
//! ```no_run
//! use ganymede::builder::Builder;
//! use ganymede::config::Config;
//! use ganymede::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Set up and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a non-standard port...
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ")?;
//!
//!     // Run the server...
//!     platform.require::<Server>().run().await
//! }
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::commands::{CommandDictionary, DispatchError};
use crate::config::Config;
use crate::platform::Platform;
use crate::proxy::ReplyCache;
use crate::request::Request;
use crate::spawn;

/// Specifies the timeout when waiting for incoming data on a client connection.
///
/// When waiting for incoming data we need to interrupt this every once in a while to
/// check if either the platform is being shut down or if the connection was asked to
/// quit.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Determines the pre-allocated receive buffer size for incoming frames. Most frames
/// will fit into this buffer so that no additional allocations are required when
/// handling a command.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so
/// that we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Represents a client connection.
pub struct Connection {
    peer_address: String,
    active: AtomicBool,
}

impl Connection {
    /// Determines if the connection is active or if a termination has been requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Terminates the connection.
    ///
    /// This is invoked by the emulated **QUIT** command; the protocol loop observes the
    /// flag and closes the socket after the confirming reply went out.
    pub fn quit(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Returns the peer address of the connected client.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Creates a detached connection for test environments.
    #[cfg(test)]
    pub(crate) fn example() -> Self {
        Connection {
            peer_address: "<example>".to_owned(),
            active: AtomicBool::new(true),
        }
    }
}

/// Represents the server which accepts and manages all client connections.
pub struct Server {
    running: AtomicBool,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given platform.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless
    /// disabled. Also note that this will not technically start the server; this has to
    /// be done manually via [run](Server::run), as it is most probably done in the main
    /// thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server has bound its socket and is accepting connections.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used: by
    /// default we listen on port 8001 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.config()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
                    handle.config()["server"]["port"]
                        .as_i64()
                        .filter(|port| *port > 0 && *port <= i64::from(u16::MAX))
                        .unwrap_or(8001)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:8001".to_owned())
    }

    /// Starts the server in a separate task.
    ///
    /// This is most probably used by test scenarios where the test itself runs in the
    /// main thread.
    pub fn fork(server: &Arc<Server>) {
        let forked_server = server.clone();
        spawn!(async move {
            if let Err(error) = forked_server.run().await {
                log::error!("{:#}", error);
            }
        });
    }

    /// Starts the server in a separate task and waits until it is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Binds the server socket and processes incoming connections until the platform
    /// shuts down.
    ///
    /// Failing to bind the socket is fatal and reported as error - there is no point in
    /// running a proxy nobody can connect to. After a successful bind the reaper of the
    /// reply cache is started; it is stopped again once the accept loop exits, so that
    /// no background task outlives the server.
    pub async fn run(&self) -> anyhow::Result<()> {
        let address = self.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Cannot open a server socket on {}", &address))?;

        log::info!("Opened server socket on {}...", &address);
        self.running.store(true, Ordering::Release);

        let cache = self.platform.find::<ReplyCache>();
        if let Some(cache) = &cache {
            cache.start();
        }

        self.server_loop(&listener).await;

        if let Some(cache) = &cache {
            cache.stop().await;
        }

        log::info!("Closed server socket on {}.", &address);
        self.running.store(false, Ordering::Release);

        Ok(())
    }

    /// Runs the accept loop which hands incoming connections to their own tasks.
    async fn server_loop(&self, listener: &TcpListener) {
        while self.platform.is_running() {
            // We use a timeout here so that the while condition (platform.is_running())
            // is checked every once in a while...
            if let Ok(connection) = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()).await
            {
                match connection {
                    Ok((stream, _)) => self.handle_new_connection(stream),
                    // A failed accept leaves the listener intact (the peer might simply
                    // have vanished between SYN and accept), therefore we log and keep
                    // accepting.
                    Err(error) => log::warn!("Error accepting a new connection: {}", error),
                }
            }
        }
    }

    /// Handles a new incoming connection by forking a task which runs the protocol loop.
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as we already optimize all writes as far
            // as possible.
            let _ = stream.set_nodelay(true);

            let connection = Arc::new(Connection {
                peer_address: stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned()),
                active: AtomicBool::new(true),
            });
            log::debug!("Accepted connection from {}...", connection.peer_address);

            if let Err(error) = protocol_loop(platform, connection.clone(), stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    connection.peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", connection.peer_address);
        });
    }
}

/// Executed per client to process incoming RESP command frames.
async fn protocol_loop(
    platform: Arc<Platform>,
    connection: Arc<Connection>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    // Acquire a dispatcher to have a lock free view of all known commands...
    let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
    // Pre-allocate a buffer for incoming frames. This will only be re-allocated if a
    // frame is larger than 8 kB...
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() && connection.is_active() {
        // We apply a timeout here so that the condition of the while loop is checked
        // every once in a while...
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            // Best case, we read some bytes from the socket...
            Ok(Ok(bytes_read)) if bytes_read > 0 => match Request::parse(&input_buffer) {
                // ...and they formed a complete command frame.
                Ok(Some(request)) => {
                    log::debug!("Received {}", request.command());

                    let request_len = request.len();
                    match dispatcher.invoke(request, Some(&connection)).await {
                        Ok(response_data) => {
                            writer.write_all(response_data.as_ref()).await?;
                            writer.flush().await?;
                        }
                        Err(DispatchError::UnsupportedCommand(command)) => {
                            // No reply is written for an unsupported command - writes
                            // in particular have to go to the upstream directly.
                            log::warn!(
                                "No handler for {} received from {}. Dropping the frame.",
                                command,
                                connection.peer_address
                            );
                        }
                        Err(DispatchError::OutputError(error)) => {
                            handle_output_error(error, &mut writer).await?;

                            // Return from the loop to effectively close the connection...
                            return Ok(());
                        }
                    }

                    input_buffer = clear_input_buffer(input_buffer, request_len);
                }
                // A malformed frame cannot be resynchronized, therefore the buffered
                // bytes are discarded. The connection stays open and no reply is
                // written for the frame.
                Err(error) => {
                    log::warn!(
                        "Received a malformed frame from {}: {}",
                        connection.peer_address,
                        error
                    );
                    input_buffer.clear();
                }
                // A partial frame is present - do nothing so that we keep on reading...
                _ => (),
            },

            // Reading from the client returned a zero length result -> the client wants
            // to close the connection. We therefore return from this loop.
            Ok(Ok(0)) => return Ok(()),

            // An IO error occurred while reading - notify our caller and abort...
            Ok(Err(error)) => {
                return Err(anyhow::anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // The timeout elapsed before any data was read => do nothing, all we want
            // is to re-evaluate our while condition anyway...
            _ => (),
        }
    }

    Ok(())
}

/// Reports a broken reply channel to the client as good as still possible.
async fn handle_output_error(
    error: crate::response::OutputError,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    // Try to send an error message if the reply was malformed. In case of an IO error
    // there is no point in sending yet another message, as it will most probably fail
    // anyway, so we just close the connection...
    if let crate::response::OutputError::ProtocolError(error) = error {
        let error_message = error.to_string().replace(['\r', '\n'], " ");
        writer
            .write_all(format!("-SERVER: {}\r\n", error_message).as_bytes())
            .await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Prepares the input buffer for the next frame after a request has been processed.
fn clear_input_buffer(mut input_buffer: BytesMut, request_len: usize) -> BytesMut {
    // If the input buffer has grown to accommodate a large frame, we shrink it here
    // again. Otherwise we clear the buffer to make room for the next frame...
    if input_buffer.capacity() > DEFAULT_BUFFER_SIZE || input_buffer.len() > request_len {
        let previous_buffer = input_buffer;
        input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        // If the previous buffer contains trailing data (a pipelined next frame), we
        // transfer it into the new buffer.
        if previous_buffer.len() > request_len {
            input_buffer.put_slice(&previous_buffer[request_len..]);
        }
    } else {
        input_buffer.truncate(0);
    }

    input_buffer
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::builder::Builder;
    use crate::cache::DecayingLruCache;
    use crate::config::Config;
    use crate::platform::Platform;
    use crate::proxy::{self, ReplyCache};
    use crate::server::Server;
    use crate::testing::{query_redis_async, test_async, MockUpstream, SHARED_TEST_RESOURCES};

    async fn start_proxy(capacity: usize, upstream: MockUpstream) -> Arc<Platform> {
        let platform = Builder::new().enable_all().disable_signals().build().await;

        platform
            .require::<Config>()
            .load_from_string(
                "
server:
    port: 1503
",
            )
            .unwrap();

        // The reaper period is zero here: expiry is covered by the deterministic clock
        // tests, while these tests focus on the wire behavior.
        let cache: Arc<ReplyCache> = Arc::new(
            DecayingLruCache::new(capacity, Duration::ZERO, Duration::from_secs(300)).unwrap(),
        );
        platform.register::<ReplyCache>(cache.clone());
        proxy::install(platform.clone(), cache, upstream);

        Server::fork_and_await(&platform.require::<Server>()).await;

        platform
    }

    #[test]
    fn ping_and_read_through_get_work_end_to_end() {
        // We want exclusive access to the 1503 port on which we fire up a test server...
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let upstream = MockUpstream::seeded(&[("test", "123")]);
            let platform = start_proxy(1024, upstream.clone()).await;

            // A PING is answered with a bulk PONG...
            let result = query_redis_async(|con| redis::cmd("PING").query::<String>(con))
                .await
                .unwrap();
            assert_eq!(result, "PONG");

            // The first GET falls through to the upstream...
            let result =
                query_redis_async(|con| redis::cmd("GET").arg("test").query::<Option<String>>(con))
                    .await
                    .unwrap();
            assert_eq!(result, Some("123".to_owned()));

            // ...and its reply stays stable even when the upstream moves on, as the
            // cached entry is served until its TTL elapses.
            upstream.put("test", "321");
            let result =
                query_redis_async(|con| redis::cmd("GET").arg("test").query::<Option<String>>(con))
                    .await
                    .unwrap();
            assert_eq!(result, Some("123".to_owned()));

            // A key the upstream doesn't know yields the nil reply...
            let result = query_redis_async(|con| {
                redis::cmd("GET").arg("missing").query::<Option<String>>(con)
            })
            .await
            .unwrap();
            assert_eq!(result, None);

            platform.terminate();
        });
    }

    #[test]
    fn the_cache_evicts_by_recency_under_capacity_pressure() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let upstream = MockUpstream::seeded(&[("a", "1"), ("b", "2"), ("c", "3")]);
            let platform = start_proxy(2, upstream.clone()).await;

            let get = |key: &'static str| {
                query_redis_async(move |con| {
                    redis::cmd("GET").arg(key).query::<Option<String>>(con)
                })
            };

            // Pull all three keys through the proxy - with capacity 2, "a" gets evicted
            // when "c" arrives...
            assert_eq!(get("a").await.unwrap(), Some("1".to_owned()));
            assert_eq!(get("b").await.unwrap(), Some("2".to_owned()));
            assert_eq!(get("c").await.unwrap(), Some("3".to_owned()));

            // Once the upstream forgets the keys, only the cached ones remain served...
            upstream.delete("a");
            upstream.delete("b");
            upstream.delete("c");

            assert_eq!(get("b").await.unwrap(), Some("2".to_owned()));
            assert_eq!(get("c").await.unwrap(), Some("3".to_owned()));
            assert_eq!(get("a").await.unwrap(), None);

            platform.terminate();
        });
    }

    #[test]
    fn a_malformed_frame_is_skipped_and_the_connection_survives() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let upstream = MockUpstream::seeded(&[]);
            let platform = start_proxy(1024, upstream).await;

            let reply = tokio::task::spawn_blocking(|| {
                use std::io::{Read, Write};

                let mut stream = std::net::TcpStream::connect("127.0.0.1:1503").unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();

                // A garbage frame produces no reply...
                stream.write_all(b"*zzz\r\n$xxx\r\nfoo\r\n").unwrap();

                // ...and after the proxy discarded it, the same connection happily
                // serves further commands. The pause ensures the garbage was consumed
                // before the valid frame arrives.
                std::thread::sleep(Duration::from_millis(500));
                stream.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();

                let mut buffer = [0u8; 64];
                let bytes_read = stream.read(&mut buffer).unwrap();
                String::from_utf8_lossy(&buffer[..bytes_read]).to_string()
            })
            .await
            .unwrap();

            assert_eq!(reply, "$4\r\nPONG\r\n");

            platform.terminate();
        });
    }

    #[test]
    fn concurrent_readers_observe_the_cached_value() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let upstream = MockUpstream::seeded(&[("test", "123")]);
            let platform = start_proxy(1024, upstream).await;

            let mut clients = Vec::new();
            for _ in 0..3 {
                clients.push(tokio::task::spawn_blocking(|| {
                    let client = redis::Client::open("redis://127.0.0.1:1503").unwrap();
                    let mut con = client
                        .get_connection_with_timeout(Duration::from_secs(5))
                        .unwrap();

                    for _ in 0..100 {
                        let value: Option<String> =
                            redis::cmd("GET").arg("test").query(&mut con).unwrap();
                        assert_eq!(value, Some("123".to_owned()));
                    }
                }));
            }

            for client in clients {
                client.await.unwrap();
            }

            platform.terminate();
        });
    }
}
