//! Plugin execution host.
//!
//! Serves packaged third-party plugin bundles to an embedding dashboard.
//! Each plugin runs as an isolated static-server process on its own
//! loopback port; the gateway extracts bundles on demand, resolves shared
//! package dependencies, supervises the server processes, and proxies
//! asset requests, injecting the capability bridge into the entry document.

pub mod blobstore;
pub mod bridge;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gateway;
pub mod registry;
pub mod resolver;
pub mod static_host;
pub mod supervisor;

pub use config::HostConfig;
pub use error::HostError;
