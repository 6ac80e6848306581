//! IPC server for cache clients

pub mod protocol;
pub mod server;

pub use server::{IpcServer, ServerContext};
