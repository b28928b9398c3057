//! Provides a tiny DI like container which keeps all central components of the proxy.
//!
//! The platform is more or less a simple map which keeps each central component as an
//! **Arc<T>** around. It also owns the central **is_running** flag which is toggled to
//! *false* once [Platform::terminate](Platform::terminate) is invoked.
//!
//! In common cases [Platform::require](Platform::require) is a good way of fetching a
//! service which is known to be there. Be aware however, that once the shutdown is
//! initiated, the internal map is cleared (so that all Drop handlers run). Therefore code
//! which might execute after [Platform::terminate](Platform::terminate) was called should
//! use [Platform::find](Platform::find) and gracefully handle the **None** case. In most
//! cases the lookup is performed during startup and **require** can be used.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use ganymede::platform::Platform;
//! struct Service {
//!     value: i32,
//! }
//!
//! struct UnknownService;
//!
//! let platform = Platform::new();
//!
//! // Registers a new service...
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! // Obtains a reference to a previously registered service...
//! assert_eq!(platform.require::<Service>().value, 42);
//!
//! // Trying to obtain a service which hasn't been registered returns an empty optional...
//! assert_eq!(platform.find::<UnknownService>().is_none(), true);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated...
//! platform.terminate();
//! // ...all services are immediately released so that their Drop handlers run...
//! assert_eq!(platform.find::<Service>().is_none(), true);
//!
//! // ...and the platform is no longer considered active.
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps all central services of the proxy in a single place.
///
/// Typically a platform is assembled by the [Builder](crate::builder::Builder) which
/// registers the enabled components. Custom services (e.g. the reply cache shared between
/// the proxy actor and the server) can be registered at any time before the server loop
/// starts.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a new component.
    ///
    /// If a component of the same type is already present, it is replaced.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// If one knows for certain that a service is present,
    /// [Platform::require](Platform::require) can be used.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let services = self.services.lock().unwrap();
        services
            .get(&TypeId::of::<T>())
            .and_then(|service| service.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered service.
    ///
    /// Note that all services are evicted when the platform shuts down. Therefore this
    /// might panic even if it worked before [Platform::terminate](Platform::terminate)
    /// was invoked.
    ///
    /// # Panics
    /// Panics if the requested service isn't available.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(service) => service,
                None => panic!(
                    "A required component ({}) was not available in the platform registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the platform is still running or if
    /// [Platform::terminate](Platform::terminate) has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services (so that their Drop handlers run
    /// eventually) and toggle the [is_running()](Platform::is_running) flag to **false**,
    /// which makes the server loop, the connection tasks and the actors exit.
    pub fn terminate(&self) {
        // Drop all services so that their Drop handlers run (sooner or later)...
        self.services.lock().unwrap().clear();

        // Mark the platform as halted...
        self.is_running.store(false, Ordering::Release);
    }
}
