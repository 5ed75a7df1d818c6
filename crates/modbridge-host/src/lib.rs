//! Loader and capability bridge for dynamically loaded HTTP modules.
//!
//! This crate is the extensibility core of an HTTP host: it brings
//! externally compiled shared libraries into the process, hands each one
//! an identity-scoped capability table, and bridges the routes they
//! register into the host's dispatch table.
//!
//! ## Layers
//!
//! - [`platform`] — the OS dynamic-loading primitives behind one interface
//! - [`muid`] — process-unique module identities
//! - [`capability`] — per-module capability table construction
//! - [`registry`] — the identity-scoped route registry bridge
//! - [`manager`] — the load/init/uninit/unload state machine
//! - [`staging`] / [`watch`] — mirror-directory staging and hot reload
//! - [`config`] — TOML settings for the module directories
//!
//! ## Trust model
//!
//! Modules are native code running in-process. The capability table keeps
//! them from *accidentally* acting under another module's identity; it is
//! not a sandbox, and a crash inside module code takes the host with it.

pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod module;
pub mod muid;
pub mod platform;
pub mod registry;
pub mod staging;
pub mod watch;

pub use capability::{CapabilityBuilder, ModuleCapabilities};
pub use config::{ConfigError, HostConfig, ModulesConfig};
pub use error::{ErrorKind, LoadError, Result, RouteError};
pub use logging::{LogSink, Severity, TracingSink};
pub use manager::ModuleManager;
pub use module::{ModuleRecord, ModuleState};
pub use muid::Muid;
pub use registry::{MethodMask, RouteBinding, RouteRegistry};
pub use watch::{ModuleWatcher, DEFAULT_DEBOUNCE};

// Re-export the ABI so hosts and tests need only one dependency.
pub use modbridge_abi as abi;
