//! gRPC Relay - transparent gRPC proxy for configuration sidecars
//!
//! Relays calls for methods it does not statically know to one backend over a
//! bounded connection pool, without decoding their payloads.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod grpc;
pub mod metrics;

pub use config::ProxyConfig;
pub use context::{CallContext, CancelHandle};
pub use error::{PoolError, RelayError};
pub use grpc::codec::{Frame, FrameCodec};
pub use grpc::director::{Director, PooledDirector};
pub use grpc::forwarder::Forwarder;
pub use grpc::pool::{ConnectionPool, PoolStats};
pub use grpc::rewrite::UrlRewriter;
pub use grpc::transport::{BackendChannel, ChannelConnector};
