// Conveyor API crate: the HTTP server module, config-driven resource
// handlers, claim extraction and the bootstrap that assembles a running
// host from the configuration file.

pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod resource;
pub mod server;

pub use bootstrap::build_host;
pub use error::ApiError;
pub use server::HttpServerModule;
