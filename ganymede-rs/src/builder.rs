//! Provides a builder which sets up and initializes the proxy framework.
//!
//! The builder creates the central parts of the proxy - logging, signal handling, the
//! configuration, the command dictionary and the server - and registers them in a
//! [Platform](crate::platform::Platform). Each part can be selectively enabled or
//! disabled, which is mainly used by tests that bring their own environment.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use ganymede::builder::Builder;
//! # use ganymede::server::Server;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register the cache and the proxy commands here...
//!
//!     // Start the main server loop...
//!     platform.require::<Server>().run().await
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, GANYMEDE_VERSION};

/// Initializes the framework by creating and initializing all enabled components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_commands: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a new builder with all features disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all features.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_commands = true;
        self.setup_server = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// This initializes **simplelog** to log to stdout. As the proxy is intended to run
    /// in containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the platform once **CTRL-C**,
    /// **SIGTERM** or **SIGHUP** is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs a [Config](crate::config::Config) and loads the settings file.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [CommandDictionary](crate::commands::CommandDictionary).
    ///
    /// For more details see: [commands](crate::commands)
    pub fn enable_commands(mut self) -> Self {
        self.setup_commands = true;
        self
    }

    /// Disables setting up a **CommandDictionary** after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_commands(mut self) -> Self {
        self.setup_commands = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server) instance.
    ///
    /// Note that the main server loop still has to be invoked manually via:
    /// `platform.require::<Server>().run().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up a **Server** instance after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all enabled
    /// components being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "((o GANYMEDE (v {}) running on {} core(s) in {} CPU(s)",
            GANYMEDE_VERSION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            let _ = crate::config::install(&platform);
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        if self.setup_commands {
            let _ = crate::commands::CommandDictionary::install(&platform);
        }

        platform
    }
}
