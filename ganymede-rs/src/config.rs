//! Contains the proxy configuration.
//!
//! The configuration is loaded from a YAML settings file once during startup. The file to
//! read is determined by [settings_file]: the first command line argument wins, then the
//! **GANYMEDE_SETTINGS** environment variable, then the default **config/settings.yml**.
//! A missing or unreadable file is not an error - every setting has a built-in default,
//! so an empty configuration yields a proxy for a local Redis on the standard port.
//!
//! The recognized settings along with their defaults are:
//!
//! ```yaml
//! server:
//!     # The interface and TCP port to accept client connections on.
//!     host: 0.0.0.0
//!     port: 8001
//! redis:
//!     # The address, password and database index of the backing Redis instance.
//!     host: localhost:6379
//!     password: ""
//!     database: 0
//! cache:
//!     # The maximum number of cached replies.
//!     capacity: 1024
//!     # The wake interval of the reaper (0 disables TTL reaping).
//!     period_ms: 100
//!     # The maximum age of a cached reply.
//!     ttl_ms: 300000
//! ```
//!
//! Components read their settings by querying the YAML document directly, e.g.
//! `config.current().config()["server"]["port"].as_i64()` - missing keys simply yield
//! **None**, so defaults are applied via `unwrap_or` at each call site.
//!
//! # Examples
//!
//! ```
//! # use ganymede::config::Config;
//! let config = Config::new("config/settings.yml");
//! config
//!     .load_from_string(
//!         "
//! server:
//!     port: 1503
//! ",
//!     )
//!     .unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.config()["server"]["port"].as_i64(), Some(1503));
//! assert_eq!(handle.config()["server"]["host"].as_str(), None);
//! ```
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::platform::Platform;

/// Provides access to the proxy configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder)
/// and can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    config: ArcSwap<Yaml>,
}

/// Represents a handle to the currently loaded configuration.
///
/// The handle pins the document which was current when it was obtained. It is cheap to
/// acquire but should not be stored for long.
pub struct Handle {
    config: Arc<Yaml>,
}

impl Handle {
    /// Provides access to the underlying configuration document.
    ///
    /// Missing sections or keys yield `Yaml::BadValue`, on which all accessors
    /// (`as_str`, `as_i64`, ...) return **None**.
    pub fn config(&self) -> &Yaml {
        &self.config
    }
}

impl Config {
    /// Creates a new config bound to the given file.
    ///
    /// Note that this will not read the file yet; this is done by [Config::load] (which
    /// in turn is invoked by [install]).
    pub fn new(file: &str) -> Self {
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new(Yaml::BadValue)),
        }
    }

    /// Returns the name of the settings file being used.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Reads and parses the settings file.
    pub fn load(&self) -> anyhow::Result<()> {
        let data = std::fs::read_to_string(&self.filename)
            .with_context(|| format!("Unable to read {}", &self.filename))?;
        self.load_from_string(&data)
    }

    /// Parses the given string as settings document and makes it the current config.
    ///
    /// This is mainly used by tests which need to control e.g. the server port without
    /// touching the file system.
    pub fn load_from_string(&self, data: &str) -> anyhow::Result<()> {
        let mut documents = YamlLoader::load_from_str(data)
            .with_context(|| format!("Unable to parse {} as YAML", &self.filename))?;

        // An empty file parses into an empty document list - treat this like a missing
        // file and keep the defaults.
        let document = if documents.is_empty() {
            Yaml::BadValue
        } else {
            documents.swap_remove(0)
        };

        self.config.store(Arc::new(document));
        Ok(())
    }
}

/// Determines the settings file to use.
///
/// The first command line argument has the highest priority, followed by the
/// **GANYMEDE_SETTINGS** environment variable and finally the default location
/// **config/settings.yml**.
pub fn settings_file() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GANYMEDE_SETTINGS").ok())
        .unwrap_or_else(|| "config/settings.yml".to_owned())
}

/// Creates and installs a **Config** into the given platform.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
/// A missing settings file is reported but not fatal - the proxy then runs on defaults.
pub fn install(platform: &Arc<Platform>) -> Arc<Config> {
    let config = Arc::new(Config::new(&settings_file()));

    match config.load() {
        Ok(_) => log::info!("Loaded settings from {}.", config.filename()),
        Err(error) => log::info!("{:#}. Using default settings.", error),
    }

    platform.register::<Config>(config.clone());

    config
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    #[test]
    fn settings_are_parsed_and_queried() {
        let config = Config::new("test.yml");
        config
            .load_from_string(
                "
server:
    host: 127.0.0.1
    port: 1503
cache:
    capacity: 16
",
            )
            .unwrap();

        let handle = config.current();
        assert_eq!(handle.config()["server"]["host"].as_str(), Some("127.0.0.1"));
        assert_eq!(handle.config()["server"]["port"].as_i64(), Some(1503));
        assert_eq!(handle.config()["cache"]["capacity"].as_i64(), Some(16));
    }

    #[test]
    fn missing_keys_yield_none() {
        let config = Config::new("test.yml");
        config.load_from_string("server:\n    port: 1503\n").unwrap();

        let handle = config.current();
        assert_eq!(handle.config()["server"]["host"].as_str(), None);
        assert_eq!(handle.config()["redis"]["database"].as_i64(), None);
    }

    #[test]
    fn an_empty_document_keeps_defaults() {
        let config = Config::new("test.yml");
        config.load_from_string("").unwrap();

        let handle = config.current();
        assert_eq!(handle.config()["server"]["port"].as_i64(), None);
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let config = Config::new("test.yml");
        assert_eq!(config.load_from_string("server: [unbalanced").is_err(), true);
    }
}
