// src/lib.rs
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resource;
pub mod scanner;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{KilnError, KilnResult};
pub use reactor::{Reactor, ReactorHandle};
pub use server::Server;
