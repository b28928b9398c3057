//! Provides the actor which implements the actual proxy commands.
//!
//! To use this facility, [install](install) has to be invoked with the shared reply
//! cache and an [Upstream](crate::upstream::Upstream) client. This registers the
//! commands in the [CommandDictionary](crate::commands::CommandDictionary) of the given
//! platform and spawns the actor which processes them.
//!
//! # Commands
//!
//! * **GET**: `GET key` performs a read-through lookup. If the reply cache holds a
//!   fresh entry for the key, the stored (already encoded) reply is sent as-is. On a
//!   miss, the upstream is consulted: an unknown key - or any upstream error - yields
//!   the nil reply, otherwise the value is encoded as bulk string, stored in the cache
//!   and sent. A later `GET` for the same key is answered from the cache until the
//!   entry's TTL elapses, so clients observe at most TTL-bounded staleness.
//! * **PING**: replies with the bulk string `PONG`. Useful as a liveness probe through
//!   the whole proxy stack.
//!
//! Note that the cache stores the *encoded* reply rather than the raw value: what was
//! stored is byte-for-byte what a hit sends, which spares the hot path any re-encoding.
//!
//! Write commands are deliberately not proxied. Writes have to go to the upstream
//! directly; the proxy picks a new value up once the TTL of the cached reply elapses
//! and the next miss refills it.
use std::sync::Arc;

use bytes::Bytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::cache::DecayingLruCache;
use crate::client_error;
use crate::commands::{queue, Call, CommandDictionary, CommandError, CommandResult, ResultExt};
use crate::platform::Platform;
use crate::response::Response;
use crate::upstream::Upstream;

/// The cache shared between the proxy actor and the server.
///
/// Values are complete, already encoded RESP replies.
pub type ReplyCache = DecayingLruCache<Bytes>;

/// Enumerates the commands supported by this actor.
#[derive(FromPrimitive)]
enum Commands {
    Get,
    Ping,
}

/// Installs the proxy actor into the given platform.
///
/// This registers the **GET** and **PING** commands in the **CommandDictionary** of the
/// platform and spawns the actor which owns the given upstream client and serves the
/// commands against the given cache.
pub fn install<U: Upstream>(platform: Arc<Platform>, cache: Arc<ReplyCache>, upstream: U) {
    let queue = actor(platform.clone(), cache, upstream);

    let commands = platform.require::<CommandDictionary>();
    commands.register_command("GET", queue.clone(), Commands::Get as usize);
    commands.register_command("PING", queue, Commands::Ping as usize);
}

/// Spawns the actual actor which processes all proxy commands.
fn actor<U: Upstream>(
    platform: Arc<Platform>,
    cache: Arc<ReplyCache>,
    upstream: U,
) -> crate::commands::Queue {
    let (queue, mut endpoint) = queue();

    let _ = tokio::spawn(async move {
        while platform.is_running() {
            match endpoint.recv().await {
                Some(mut call) => match Commands::from_usize(call.token) {
                    Some(Commands::Get) => {
                        let result = get_command(&mut call, &cache, &upstream).await;
                        result.complete(call)
                    }
                    Some(Commands::Ping) => ping_command(&mut call).complete(call),
                    _ => call.handle_unknown_token(),
                },
                None => return,
            }
        }
    });

    queue
}

/// Handles `GET key`: serve from the cache, fall through to the upstream on a miss.
async fn get_command<U: Upstream>(
    call: &mut Call,
    cache: &ReplyCache,
    upstream: &U,
) -> CommandResult {
    if call.request.parameter_count() != 1 {
        return Err(client_error!(
            "GET expects exactly one parameter but {} were provided",
            call.request.parameter_count()
        ));
    }

    let key = call.request.str_parameter(0)?;

    if let Some(reply) = cache.get(key) {
        call.response.raw(reply.as_ref())?;
        return Ok(());
    }

    match upstream.get(key).await {
        Ok(Some(value)) => {
            // Encode the reply once, cache the encoded form and send exactly those
            // bytes - a later hit replays them verbatim.
            let mut encoded = Response::new();
            encoded.bulk(value.as_ref())?;
            let reply = encoded.complete().map_err(CommandError::OutputError)?.freeze();

            cache.add(key.to_owned(), reply.clone());
            call.response.raw(reply.as_ref())?;
        }
        Ok(None) => {
            call.response.nil()?;
        }
        Err(error) => {
            // Whatever went wrong towards the upstream, the client simply sees an
            // absent value and may retry.
            log::warn!("{:#}", error);
            call.response.nil()?;
        }
    }

    Ok(())
}

/// Handles `PING` with a bulk `PONG`.
fn ping_command(call: &mut Call) -> CommandResult {
    call.response.bulk("PONG")?;
    Ok(())
}
