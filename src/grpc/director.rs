//! Per-call routing decision
//!
//! The director picks the backend connection a call runs on and prepares the
//! outbound context. Resolution happens before any backend stream exists, so
//! every failure here aborts the call without leaking a pooled connection.

use async_trait::async_trait;
use std::sync::Arc;
use tonic::Status;

use super::pool::{ConnectionPool, Connector, PooledConnection};
use super::stream::Transport;
use crate::context::{CallContext, CancelHandle};

/// Split a gRPC path `/package.Service/Method` into service and method
pub fn split_method(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

/// Where a call goes and what it runs under.
///
/// `cancel` aborts the outbound call; dropping the destination cancels it and
/// returns the connection to the pool.
pub struct Destination<T> {
    pub ctx: CallContext,
    pub cancel: CancelHandle,
    pub conn: PooledConnection<T>,
}

#[async_trait]
pub trait Director: Send + Sync + 'static {
    type Conn: Transport;

    /// Resolve the destination for `method`, or the status that ends the call
    async fn resolve(
        &self,
        inbound: &CallContext,
        method: &str,
    ) -> Result<Destination<Self::Conn>, Status>;
}

/// Director handing every accepted call a connection from one backend pool
pub struct PooledDirector<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    allowed_services: Vec<String>,
}

impl<C: Connector> PooledDirector<C> {
    /// An empty allow-list accepts every well-formed method
    pub fn new(pool: Arc<ConnectionPool<C>>, allowed_services: Vec<String>) -> Self {
        Self {
            pool,
            allowed_services,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    fn accepts(&self, method: &str) -> bool {
        let Some((service, _)) = split_method(method) else {
            return false;
        };
        self.allowed_services.is_empty() || self.allowed_services.iter().any(|s| s == service)
    }
}

#[async_trait]
impl<C> Director for PooledDirector<C>
where
    C: Connector,
    C::Conn: Transport,
{
    type Conn = C::Conn;

    async fn resolve(
        &self,
        inbound: &CallContext,
        method: &str,
    ) -> Result<Destination<Self::Conn>, Status> {
        if !self.accepts(method) {
            return Err(Status::unimplemented(format!("Unknown method {}", method)));
        }

        let conn = tokio::select! {
            conn = self.pool.acquire() => conn.map_err(|e| {
                tracing::warn!(method, error = %e, "No backend connection for call");
                Status::from(e)
            })?,
            _ = inbound.cancelled() => {
                return Err(Status::cancelled("Call cancelled while connecting to backend"));
            }
        };

        // Outgoing contexts start without metadata
        let (ctx, cancel) = inbound.with_cancel();
        let ctx = ctx.with_metadata(inbound.metadata().clone());

        Ok(Destination { ctx, cancel, conn })
    }
}
