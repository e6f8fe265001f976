//! HTTP API: streaming chat endpoint plus service plumbing

pub mod server;

pub use server::{ApiServer, ApiServerConfig};
