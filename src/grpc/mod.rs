//! Transparent gRPC proxy engine
//!
//! Calls for methods this server does not know are relayed as opaque frames
//! to a single backend over pooled connections. Headers, trailers and status
//! flow back unchanged, except for the download URL lookup whose response is
//! rewritten to point at this proxy.

pub mod codec;
pub mod director;
pub mod download;
pub mod forwarder;
pub mod pool;
pub mod rewrite;
pub mod server;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
