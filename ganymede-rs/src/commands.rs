//! Provides the dispatcher which routes an incoming request to the matching handler.
//!
//! At its core, a [CommandDictionary](CommandDictionary) is simply a hash map. For each
//! known command it keeps a [Queue](Queue) along with a numeric token. When a matching
//! command is received, the request and a pre-initialized response are wrapped into a
//! [Call](Call) - equipped with the **Sender** of a oneshot channel through which the
//! serialized reply travels back - and pushed into the queue. On the other end of the
//! queue sits an actor which owns all the state the command needs (for the proxy: the
//! reply cache and the upstream connection) and which processes one call at a time.
//!
//! Using queues towards single threaded actors keeps the handlers free of locks and
//! side-steps async traits: from the actor's point of view the world is sequential,
//! while the server remains fully concurrent across connections.
//!
//! Each connection obtains its own [Dispatcher](Dispatcher) - a read-only copy of the
//! dictionary - so that dispatching itself requires no synchronization at all (once the
//! proxy is set up, the set of commands never changes anyway).
//!
//! # Unknown commands
//!
//! A request for which no handler is registered yields
//! [DispatchError::UnsupportedCommand]. The server logs these and deliberately writes
//! nothing for the frame. Two exceptions are emulated here, as common Redis client
//! libraries issue them during connection setup and would otherwise hang: **QUIT**
//! (confirms with +OK and flags the connection for termination) and **CLIENT**
//! (confirmed with +OK and otherwise ignored).
//!
//! # Errors
//!
//! A handler returns a [CommandResult](CommandResult). Client errors (bad arguments)
//! and server errors are rendered as RESP error replies by [Call::complete], so a
//! misbehaving request never tears down the connection. Only an
//! [OutputError](crate::response::OutputError) escalates to the protocol loop, as it
//! indicates that the reply channel itself is broken. The [server_error!] and
//! [client_error!] macros ease constructing the two recoverable kinds.
//!
//! # Example
//!
//! ```
//! # use ganymede::commands::{queue, CommandDictionary, CommandResult, ResultExt};
//! # use ganymede::request::Request;
//! # #[tokio::main]
//! # async fn main() {
//! // Attach a trivial actor which answers every call with "PONG"...
//! let (queue, mut endpoint) = queue();
//! tokio::spawn(async move {
//!     while let Some(mut call) = endpoint.recv().await {
//!         let result: CommandResult = call.response.bulk("PONG").map_err(|error| error.into());
//!         result.complete(call);
//!     }
//! });
//!
//! // ...register it and dispatch a request to it.
//! let commands = CommandDictionary::new();
//! commands.register_command("PING", queue, 0);
//!
//! let mut dispatcher = commands.dispatcher();
//! let result = dispatcher
//!     .invoke(Request::example(vec!["PING"]), None)
//!     .await
//!     .unwrap();
//! assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$4\r\nPONG\r\n");
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::BytesMut;

use crate::platform::Platform;
use crate::request::Request;
use crate::response::{OutputError, Response};
use crate::server::Connection;

/// Represents an error when executing a command.
///
/// We mainly distinguish three cases: an **OutputError** occurs if the
/// [Response](crate::response::Response) fails to produce a reply - such a connection is
/// considered broken. A **ServerError** signals an unexpected server-sided problem. A
/// **ClientError** - the common case - signals that the data passed in by the client was
/// invalid or didn't match the expectations of the handler.
#[derive(Debug)]
pub enum CommandError {
    /// The reply could not be created; the connection should be closed.
    OutputError(OutputError),

    /// The client sent invalid or inconsistent data.
    ClientError(anyhow::Error),

    /// An unexpected problem occurred within the server.
    ServerError(anyhow::Error),
}

/// Provides a simple way of creating a **CommandError** which represents a server error.
///
/// # Example
///
/// ```
/// use ganymede::commands::{Call, CommandResult};
/// fn my_command(call: &mut Call) -> CommandResult {
///     Err(ganymede::server_error!("We forgot to implement this command."))
/// }
/// ```
#[macro_export]
macro_rules! server_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

/// Provides a simple way of creating a **CommandError** which represents a client error.
///
/// # Example
///
/// ```
/// use ganymede::commands::{Call, CommandResult};
/// fn my_command(call: &mut Call) -> CommandResult {
///     if call.request.parameter_count() != 1 {
///         Err(ganymede::client_error!(
///             "This command expects one parameter but {} were provided",
///             call.request.parameter_count()
///         ))
///     } else {
///         call.response.ok()?;
///         Ok(())
///     }
/// }
/// ```
#[macro_export]
macro_rules! client_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

impl From<OutputError> for CommandError {
    fn from(output_error: OutputError) -> Self {
        CommandError::OutputError(output_error)
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(error: anyhow::Error) -> Self {
        CommandError::ClientError(error)
    }
}

/// Represents the return type of command handlers.
///
/// This is either an empty result (the actual reply is passed through the response
/// within the call) or a **CommandError**.
pub type CommandResult = std::result::Result<(), CommandError>;

/// Represents an error reported by [Dispatcher::invoke].
///
/// Everything recoverable (client errors, server errors) has already been rendered into
/// a RESP error reply at this point. What remains is either a command nobody handles -
/// for which the server writes nothing - or a broken reply channel, which terminates
/// the connection.
#[derive(Debug)]
pub enum DispatchError {
    /// No handler is registered for the received command.
    UnsupportedCommand(String),

    /// The reply could not be produced or delivered.
    OutputError(OutputError),
}

/// Provides an extension trait on [CommandResult](CommandResult) so that **complete**
/// can be invoked directly on it: `my_command(&mut call).complete(call)`.
///
/// Note that this has to be defined as a trait so that we can "attach" it to
/// [CommandResult](CommandResult), which is internally a plain Rust **Result**.
pub trait ResultExt {
    /// Completes the given call with the wrapped result.
    fn complete(self, call: Call);
}

impl ResultExt for CommandResult {
    fn complete(self, call: Call) {
        call.complete(self);
    }
}

/// Represents the invocation of a command.
///
/// This wraps the request, a pre-initialized response and the command token in a single
/// struct which is sent to the responsible actor through its queue. The embedded
/// callback (a oneshot sender) is handled internally - an actor only has to invoke
/// [complete](Call::complete) (or [ResultExt::complete]) once per call.
pub struct Call {
    /// Contains the request as sent by the client.
    pub request: Request,

    /// Contains the response to be filled with the reply.
    pub response: Response,

    /// Contains the token of the command being called.
    ///
    /// Commonly a bunch of commands share a single queue, so that their invocations are
    /// "single threaded" from the view of the actor; the token tells them apart.
    pub token: usize,

    callback: tokio::sync::oneshot::Sender<Result<BytesMut, OutputError>>,
}

impl Call {
    /// Marks the command represented by this call as handled.
    ///
    /// On success, this serializes the response and sends it back to the caller. Client
    /// and server errors are transformed into RESP error replies ("-CLIENT: ..." /
    /// "-SERVER: ..."), so the connection keeps operating. An **OutputError** is passed
    /// through as-is; the caller will close the connection in response.
    pub fn complete(mut self, result: CommandResult) {
        let result = match result {
            Ok(_) => self.response.complete(),
            Err(CommandError::OutputError(error)) => Err(error),
            Err(CommandError::ClientError(error)) => {
                match self.response.error(format!("CLIENT: {}", error)) {
                    Ok(_) => self.response.complete(),
                    Err(error) => Err(error),
                }
            }
            Err(CommandError::ServerError(error)) => {
                match self.response.error(format!("SERVER: {}", error)) {
                    Ok(_) => self.response.complete(),
                    Err(error) => Err(error),
                }
            }
        };

        if self.callback.send(result).is_err() {
            log::error!("Failed to submit a result to a oneshot callback channel!");
        }
    }

    /// Completes a call whose token is unknown to the receiving actor.
    ///
    /// This indicates a programming error (a command was registered with a token its
    /// actor doesn't understand) and is reported as server error.
    pub fn handle_unknown_token(self) {
        let token = self.token;
        self.complete(Err(CommandError::ServerError(anyhow!(
            "Unknown token received: {}!",
            token
        ))));
    }
}

/// Represents a queue which can be stored in a [CommandDictionary](CommandDictionary) in
/// order to receive [Calls](Call) to be handled.
pub type Queue = tokio::sync::mpsc::Sender<Call>;

/// Represents the endpoint of a [Queue](Queue) which is moved into an actor in order to
/// receive [Calls](Call) there.
pub type Endpoint = tokio::sync::mpsc::Receiver<Call>;

/// Creates a new queue which connects an actor to the
/// [CommandDictionary](CommandDictionary).
///
/// The queues are bounded (1024 entries), which is plenty for queued commands of the
/// expected number of clients. We'd rather reject commands in an overload condition
/// than crash the whole proxy while running out of memory.
pub fn queue() -> (Queue, Endpoint) {
    tokio::sync::mpsc::channel(1024)
}

/// Wraps a command which has previously been registered.
struct Command {
    name: &'static str,
    queue: Queue,
    token: usize,
}

/// Represents an internally mutable dictionary which maps command names to queues.
///
/// The dictionary itself isn't used to dispatch commands. That is the job of the
/// [Dispatcher](Dispatcher), a read-only copy which operates without any locking.
#[derive(Default)]
pub struct CommandDictionary {
    commands: Mutex<HashMap<&'static str, Arc<Command>>>,
}

/// Provides a read-only view of a [CommandDictionary](CommandDictionary) used to
/// dispatch calls into the appropriate queue.
pub struct Dispatcher {
    commands: HashMap<&'static str, (Arc<Command>, Queue)>,
}

impl CommandDictionary {
    /// Creates a new and empty dictionary.
    ///
    /// Note that most probably a dictionary is already present and can be obtained from
    /// the [Platform](crate::platform::Platform) via
    /// `platform.require::<CommandDictionary>()`.
    pub fn new() -> Self {
        CommandDictionary {
            commands: Mutex::new(HashMap::default()),
        }
    }

    /// Creates and installs a dictionary into the given platform.
    ///
    /// Note that this is performed by the [Builder](crate::builder::Builder) unless
    /// disabled.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let commands = Arc::new(CommandDictionary::new());
        platform.register::<CommandDictionary>(commands.clone());

        commands
    }

    /// Registers a command for the given name to be dispatched into the given queue.
    ///
    /// As most probably multiple commands are dispatched to a single queue, their calls
    /// are disambiguated by the given token.
    pub fn register_command(&self, name: &'static str, queue: Queue, token: usize) {
        let mut commands = self.commands.lock().unwrap();
        if commands.contains_key(name) {
            log::error!(
                "Not going to register command {} as there is already a command present for this name",
                name
            );
        } else {
            log::debug!("Registering command {}...", name);
            let _ = commands.insert(name, Arc::new(Command { name, queue, token }));
        }
    }

    /// Creates a read-only copy of the known commands and returns it as dispatcher.
    pub fn dispatcher(&self) -> Dispatcher {
        let commands = self.commands.lock().unwrap();
        let mut cloned_commands = HashMap::with_capacity(commands.len());
        for command in commands.values() {
            let _ = cloned_commands.insert(command.name, (command.clone(), command.queue.clone()));
        }

        Dispatcher {
            commands: cloned_commands,
        }
    }
}

impl Dispatcher {
    /// Dispatches the given request to the appropriate queue and returns the reply.
    ///
    /// The reply is a RESP response already marshalled into a byte buffer - application
    /// level errors are rendered as "-CLIENT: ..." / "-SERVER: ..." in there. The errors
    /// reported by this method are the ones the protocol loop itself must act on: see
    /// [DispatchError].
    ///
    /// If this command has been issued via a connection, a reference to it can be passed
    /// in; otherwise (most probably in tests) **None** can be used. The connection is
    /// only consulted by the emulated **QUIT** command.
    pub async fn invoke(
        &mut self,
        request: Request,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, DispatchError> {
        let response = Response::new();
        match self.commands.get_mut(request.command()) {
            Some((command, queue)) => Dispatcher::invoke_command(command, queue, request, response)
                .await
                .map_err(DispatchError::OutputError),
            _ => Dispatcher::handle_built_in(request, response, connection),
        }
    }

    /// Emulates the connection-level commands common Redis client libraries emit.
    ///
    /// Everything else which reaches this point is unsupported: the proxy only ever
    /// forwards reads, writes must go to the upstream directly.
    fn handle_built_in(
        request: Request,
        mut response: Response,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, DispatchError> {
        match request.command() {
            "QUIT" => {
                if let Some(connection) = connection {
                    connection.quit();
                }
                response.ok().map_err(DispatchError::OutputError)?;
            }
            "CLIENT" => {
                response.ok().map_err(DispatchError::OutputError)?;
            }
            _ => {
                return Err(DispatchError::UnsupportedCommand(
                    request.command().to_owned(),
                ));
            }
        }

        response.complete().map_err(DispatchError::OutputError)
    }

    async fn invoke_command(
        command: &Arc<Command>,
        queue: &mut Queue,
        request: Request,
        response: Response,
    ) -> Result<BytesMut, OutputError> {
        let (callback, promise) = tokio::sync::oneshot::channel();
        let call = Call {
            request,
            response,
            callback,
            token: command.token,
        };

        if queue.send(call).await.is_err() {
            Err(OutputError::ProtocolError(anyhow!(
                "Failed to submit command into queue!"
            )))
        } else {
            match promise.await {
                Ok(result) => result,
                _ => Err(OutputError::ProtocolError(anyhow!(
                    "Command {} did not yield any result!",
                    command.name
                ))),
            }
        }
    }
}
