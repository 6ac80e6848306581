//! WebDAV remote file tier

pub mod client;
pub mod errors;
pub mod store;
pub mod types;

pub use client::{Credentials, WebDavClient};
pub use errors::WebDavError;
pub use store::RemoteStore;
pub use types::WebDavFile;
