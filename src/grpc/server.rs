//! Frontend gRPC server initialization and lifecycle management
//!
//! The server registers no services of its own. Every call lands on the
//! router's fallback, [`ProxyService`], which decodes nothing and hands the
//! raw stream to the [`Forwarder`].

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::codegen::{BoxFuture, BoxStream, Service};
use tonic::metadata::MetadataMap;
use tonic::server::StreamingService;
use tonic::service::Routes;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Code, Request, Response, Status};

use super::codec::{Frame, FrameCodec};
use super::director::Director;
use super::forwarder::Forwarder;
use super::stream::{CallerSink, FrameSink, FrameSource};
use crate::config::ProxyConfig;
use crate::context::{CallContext, CancelHandle};
use crate::error::RelayError;

/// Headers describing one hop's encoding, never forwarded to the next hop
const HOP_HEADERS: [&str; 2] = ["grpc-encoding", "grpc-accept-encoding"];

fn strip_hop_headers(mut metadata: MetadataMap) -> MetadataMap {
    for key in HOP_HEADERS {
        metadata.remove(key);
    }
    metadata
}

/// Unknown-method handler: proxies whatever path it receives.
///
/// Every inbound call runs under a context derived from `server_ctx`, so
/// cancelling that context ends all calls in flight.
pub struct ProxyService<D: Director> {
    forwarder: Arc<Forwarder<D>>,
    server_ctx: CallContext,
    max_message_size: usize,
    buffer: usize,
}

impl<D: Director> Clone for ProxyService<D> {
    fn clone(&self) -> Self {
        Self {
            forwarder: self.forwarder.clone(),
            server_ctx: self.server_ctx.clone(),
            max_message_size: self.max_message_size,
            buffer: self.buffer,
        }
    }
}

impl<D: Director> ProxyService<D> {
    pub fn new(
        forwarder: Arc<Forwarder<D>>,
        server_ctx: CallContext,
        max_message_size: usize,
        buffer: usize,
    ) -> Self {
        Self {
            forwarder,
            server_ctx,
            max_message_size,
            buffer: buffer.max(1),
        }
    }
}

impl<D: Director> Service<http::Request<axum::body::Body>> for ProxyService<D> {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<axum::body::Body>) -> Self::Future {
        let call = RelayCall {
            forwarder: self.forwarder.clone(),
            server_ctx: self.server_ctx.clone(),
            method: req.uri().path().to_string(),
            buffer: self.buffer,
        };
        let max_message_size = self.max_message_size;

        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(FrameCodec)
                .accept_compressed(CompressionEncoding::Gzip)
                .apply_max_message_size_config(Some(max_message_size), Some(max_message_size));
            Ok(grpc.streaming(call, req).await)
        })
    }
}

/// One inbound call, driven as a full-duplex stream
struct RelayCall<D: Director> {
    forwarder: Arc<Forwarder<D>>,
    server_ctx: CallContext,
    method: String,
    buffer: usize,
}

impl<D: Director> StreamingService<Frame> for RelayCall<D> {
    type Response = Frame;
    type ResponseStream = CancelOnDrop;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Frame>>) -> Self::Future {
        let forwarder = self.forwarder.clone();
        let (ctx, cancel) = self.server_ctx.with_cancel();
        let method = self.method.clone();
        let buffer = self.buffer;

        Box::pin(async move {
            let (metadata, _, inbound) = request.into_parts();
            let ctx = ctx.with_metadata(strip_hop_headers(metadata));

            let (frames_tx, mut frames_rx) = mpsc::channel(buffer);
            let (header_tx, header_rx) = oneshot::channel();
            let (trailer_tx, mut trailer_rx) = oneshot::channel();

            let sink = ServerStreamSink {
                frames: frames_tx.clone(),
                header_tx: Some(header_tx),
                trailer_tx: Some(trailer_tx),
            };
            tokio::spawn(async move {
                let result = forwarder
                    .handle(&ctx, &method, ServerStreamSource(inbound), sink)
                    .await;
                // Success carries the backend trailers on an OK status
                let terminal = match result {
                    Ok(()) => Status::with_metadata(
                        Code::Ok,
                        "",
                        trailer_rx.try_recv().unwrap_or_default(),
                    ),
                    Err(status) => status,
                };
                let _ = frames_tx.send(Err(terminal)).await;
            });

            let (headers, frames) = match header_rx.await {
                Ok(headers) => (
                    headers,
                    Box::pin(ReceiverStream::new(frames_rx)) as BoxStream<Frame>,
                ),
                // No headers means nothing was relayed: fail as trailers-only
                Err(_) => match frames_rx.recv().await {
                    Some(Err(status)) if status.code() != Code::Ok => return Err(status),
                    first => (
                        MetadataMap::new(),
                        Box::pin(futures::stream::iter(first).chain(ReceiverStream::new(frames_rx)))
                            as BoxStream<Frame>,
                    ),
                },
            };

            let mut response = Response::new(CancelOnDrop {
                frames,
                _cancel: cancel,
            });
            *response.metadata_mut() = headers;
            Ok(response)
        })
    }
}

/// Response stream that cancels the call once the caller stops reading it
pub struct CancelOnDrop {
    frames: BoxStream<Frame>,
    _cancel: CancelHandle,
}

impl Stream for CancelOnDrop {
    type Item = Result<Frame, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx)
    }
}

/// Request stream of the inbound call
struct ServerStreamSource(Streaming<Frame>);

#[async_trait]
impl FrameSource for ServerStreamSource {
    async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        match self.0.message().await? {
            Some(frame) => Ok(frame),
            None => Err(RelayError::Eof),
        }
    }
}

/// Response side of the inbound call
struct ServerStreamSink {
    frames: mpsc::Sender<Result<Frame, Status>>,
    header_tx: Option<oneshot::Sender<MetadataMap>>,
    trailer_tx: Option<oneshot::Sender<MetadataMap>>,
}

#[async_trait]
impl FrameSink for ServerStreamSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError> {
        self.frames
            .send(Ok(frame))
            .await
            .map_err(|_| RelayError::Eof)
    }
}

impl CallerSink for ServerStreamSink {
    fn send_header(&mut self, headers: MetadataMap) -> Result<(), Status> {
        let tx = self
            .header_tx
            .take()
            .ok_or_else(|| Status::internal("Response headers already sent"))?;
        tx.send(strip_hop_headers(headers))
            .map_err(|_| Status::cancelled("Caller went away"))
    }

    fn set_trailer(&mut self, trailers: MetadataMap) {
        if let Some(tx) = self.trailer_tx.take() {
            let _ = tx.send(trailers);
        }
    }
}

/// Routes sending every method to the proxy; calls end when `server_ctx` is cancelled
pub fn proxy_routes<D: Director>(
    forwarder: Arc<Forwarder<D>>,
    server_ctx: CallContext,
    max_message_size: usize,
    buffer: usize,
) -> Routes {
    let router = axum::Router::new().fallback_service(ProxyService::new(
        forwarder,
        server_ctx,
        max_message_size,
        buffer,
    ));
    Routes::from(router)
}

/// Start the frontend gRPC server
///
/// Runs until `shutdown` resolves or the server fails. Should be spawned as a
/// background task alongside the admin HTTP server.
///
/// Shutdown cancels every call still in flight, long-lived streams included,
/// so draining the connections ends promptly.
pub async fn start_grpc_server<D, F>(
    listener: TcpListener,
    forwarder: Arc<Forwarder<D>>,
    config: &ProxyConfig,
    shutdown: F,
) -> Result<()>
where
    D: Director,
    F: Future<Output = ()> + Send,
{
    let keepalive = &config.pool.keepalive;
    let mut builder = Server::builder()
        .tcp_nodelay(true)
        .http2_keepalive_interval(Some(keepalive.interval()))
        .http2_keepalive_timeout(Some(keepalive.timeout()));

    let addr = listener.local_addr().context("gRPC listener has no address")?;
    if let Some(tls) = &config.tls {
        let cert = std::fs::read_to_string(&tls.cert_path)
            .with_context(|| format!("Failed to read TLS certificate: {:?}", tls.cert_path))?;
        let key = std::fs::read_to_string(&tls.key_path)
            .with_context(|| format!("Failed to read TLS key: {:?}", tls.key_path))?;
        let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

        if let Some(ca_path) = &tls.client_ca_path {
            let ca = std::fs::read_to_string(ca_path)
                .with_context(|| format!("Failed to read client CA: {:?}", ca_path))?;
            tls_config = tls_config.client_ca_root(Certificate::from_pem(ca));
        }

        tracing::info!(
            addr = %addr,
            mtls = tls.client_ca_path.is_some(),
            max_message_mb = config.max_message_size_mb,
            "Starting gRPC proxy with TLS"
        );
        builder = builder
            .tls_config(tls_config)
            .context("Invalid gRPC TLS configuration")?;
    } else {
        tracing::info!(
            addr = %addr,
            max_message_mb = config.max_message_size_mb,
            "Starting gRPC proxy (no TLS)"
        );
    }

    let (server_ctx, stop_calls) = CallContext::new(MetadataMap::new());
    let shutdown = async move {
        shutdown.await;
        tracing::info!("Cancelling in-flight proxied calls");
        stop_calls.cancel();
    };

    builder
        .add_routes(proxy_routes(
            forwarder,
            server_ctx,
            config.max_message_size(),
            config.stream_buffer,
        ))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("gRPC server error")?;

    tracing::info!("gRPC proxy stopped");
    Ok(())
}
