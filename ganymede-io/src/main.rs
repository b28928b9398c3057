use std::panic::{set_hook, take_hook};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use ganymede::builder::Builder;
use ganymede::cache::DecayingLruCache;
use ganymede::config::Config;
use ganymede::platform::Platform;
use ganymede::proxy::{self, ReplyCache};
use ganymede::server::Server;
use ganymede::upstream::{RedisUpstream, Upstream};

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying to
    // survive with a missing tokio background task. Having a panic in a tokio task is
    // quite ugly, as the proxy seems healthy from the outside but won't handle any
    // incoming commands.
    //
    // Therefore we crash the whole process on purpose and hope for an external watchdog
    // like docker-compose to create a new container which is in a sane and consistent
    // state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a task. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    // Build a platform with all framework components enabled...
    let platform = Builder::new().enable_all().build().await;

    // ...and wire the proxy specific parts into it. Misconfiguration, an unreachable
    // upstream and a taken server port are all fatal: a supervisor should restart us
    // once the environment is fixed.
    if let Err(error) = run(platform).await {
        log::error!("{:#}", error);
        std::process::exit(1);
    }
}

/// Reads the settings, connects the upstream, creates the cache and runs the server.
async fn run(platform: Arc<Platform>) -> anyhow::Result<()> {
    let config = platform.require::<Config>();
    let handle = config.current();
    let settings = handle.config();

    let upstream_address = settings["redis"]["host"]
        .as_str()
        .unwrap_or("localhost:6379")
        .to_owned();
    let upstream_password = settings["redis"]["password"].as_str().unwrap_or("").to_owned();
    let upstream_database = settings["redis"]["database"].as_i64().unwrap_or(0);

    let capacity = settings["cache"]["capacity"].as_i64().unwrap_or(1024);
    let period_ms = settings["cache"]["period_ms"].as_i64().unwrap_or(100);
    let ttl_ms = settings["cache"]["ttl_ms"].as_i64().unwrap_or(300_000);

    log::info!(
        "Proxying {} (database {}) - capacity: {}, period: {} ms, ttl: {} ms",
        upstream_address,
        upstream_database,
        capacity,
        period_ms,
        ttl_ms
    );

    let upstream =
        RedisUpstream::connect(&upstream_address, &upstream_password, upstream_database).await?;
    let response = upstream.ping().await?;
    log::info!("Pinged the upstream {}: {}", upstream_address, response);

    let capacity = usize::try_from(capacity)
        .ok()
        .filter(|capacity| *capacity > 0)
        .context("The cache capacity must be a positive number")?;
    let period = duration_ms(period_ms).context("The reaper period must not be negative")?;
    let ttl = duration_ms(ttl_ms).context("The entry TTL must not be negative")?;

    let cache: Arc<ReplyCache> = Arc::new(DecayingLruCache::new(capacity, period, ttl)?);
    platform.register::<ReplyCache>(cache.clone());
    proxy::install(platform.clone(), cache, upstream);

    platform.require::<Server>().run().await
}

fn duration_ms(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}
