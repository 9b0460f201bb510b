//! tonic-backed backend connections
//!
//! A [`BackendChannel`] is one HTTP/2 connection to the backend. Each proxied
//! call opens a raw full-duplex stream on it using [`FrameCodec`], so the
//! backend sees exactly the method path and messages the caller sent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::metadata::MetadataMap;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status};

use super::codec::{Frame, FrameCodec};
use super::pool::Connector;
use super::stream::{BackendSink, BackendSource, FrameSink, FrameSource, Transport};
use crate::config::ProxyConfig;
use crate::context::CallContext;
use crate::error::{PoolError, RelayError};

/// Dials [`BackendChannel`]s with the configured keep-alive and TLS settings
pub struct ChannelConnector {
    endpoint: Endpoint,
    max_message_size: usize,
    buffer: usize,
}

impl ChannelConnector {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let keepalive = &config.pool.keepalive;
        let mut endpoint = Endpoint::from_shared(config.backend.uri())
            .with_context(|| format!("Invalid backend address: {}", config.backend.address))?
            .connect_timeout(config.pool.dial_timeout())
            .tcp_nodelay(true)
            .tcp_keepalive(Some(keepalive.interval()))
            .http2_keep_alive_interval(keepalive.interval())
            .keep_alive_timeout(keepalive.timeout())
            .keep_alive_while_idle(keepalive.permit_without_stream);

        if let Some(tls) = &config.backend.tls {
            let mut tls_config = match &tls.ca_cert_path {
                Some(path) => {
                    let pem = std::fs::read(path).with_context(|| {
                        format!("Failed to read backend CA certificate: {:?}", path)
                    })?;
                    ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem))
                }
                None => ClientTlsConfig::new().with_webpki_roots(),
            };
            if let Some(domain) = &tls.domain {
                tls_config = tls_config.domain_name(domain.clone());
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .context("Invalid backend TLS configuration")?;
        }

        Ok(Self {
            endpoint,
            max_message_size: config.max_message_size(),
            buffer: config.stream_buffer,
        })
    }

    /// Backend URI this connector dials
    pub fn backend(&self) -> &http::Uri {
        self.endpoint.uri()
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Conn = BackendChannel;

    async fn connect(&self) -> Result<BackendChannel, PoolError> {
        let channel = self.endpoint.connect().await.map_err(|e| {
            let detail = match std::error::Error::source(&e) {
                Some(source) => format!("{} ({}): {}", self.backend(), e, source),
                None => format!("{} ({})", self.backend(), e),
            };
            PoolError::Dial(detail)
        })?;

        tracing::info!(backend = %self.backend(), "Connected to backend");

        Ok(BackendChannel {
            channel,
            max_message_size: self.max_message_size,
            buffer: self.buffer,
        })
    }
}

/// One live connection to the backend
#[derive(Clone)]
pub struct BackendChannel {
    channel: Channel,
    max_message_size: usize,
    buffer: usize,
}

impl BackendChannel {
    pub fn new(channel: Channel, max_message_size: usize, buffer: usize) -> Self {
        Self {
            channel,
            max_message_size,
            buffer: buffer.max(1),
        }
    }
}

impl Transport for BackendChannel {
    type Sink = ChannelSink;
    type Source = ChannelSource;

    fn open_stream(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<(Self::Sink, Self::Source), Status> {
        let path: PathAndQuery = method
            .parse()
            .map_err(|_| Status::unimplemented(format!("Invalid method path {}", method)))?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let mut request = Request::new(ReceiverStream::new(rx));
        *request.metadata_mut() = ctx.metadata().clone();

        let mut grpc = tonic::client::Grpc::new(self.channel.clone())
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size);

        let call = Box::pin(async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("Backend not ready: {}", e)))?;
            grpc.streaming(request, path, FrameCodec).await
        });

        let source = ChannelSource {
            ctx: ctx.clone(),
            state: SourceState::Pending(call),
            trailers: None,
        };
        Ok((ChannelSink { tx: Some(tx) }, source))
    }
}

/// Request side of a backend stream
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::Eof)?;
        // The request body is gone once the backend finished the call
        tx.send(frame).await.map_err(|_| RelayError::Eof)
    }
}

#[async_trait]
impl BackendSink for ChannelSink {
    async fn close_send(&mut self) {
        self.tx = None;
    }
}

enum SourceState {
    /// Waiting for the backend's response headers
    Pending(BoxFuture<'static, Result<Response<Streaming<Frame>>, Status>>),
    Open {
        headers: MetadataMap,
        stream: Streaming<Frame>,
    },
    /// The call failed before any headers arrived
    Failed(Status),
}

/// Response side of a backend stream
pub struct ChannelSource {
    ctx: CallContext,
    state: SourceState,
    trailers: Option<MetadataMap>,
}

impl ChannelSource {
    async fn open(&mut self) -> Result<(), Status> {
        if let SourceState::Pending(call) = &mut self.state {
            let result = tokio::select! {
                result = call => result,
                _ = self.ctx.cancelled() => Err(Status::cancelled("Outbound call cancelled")),
            };
            self.state = match result {
                Ok(response) => {
                    let (headers, stream, _) = response.into_parts();
                    SourceState::Open { headers, stream }
                }
                Err(status) => SourceState::Failed(status),
            };
        }

        match &self.state {
            SourceState::Failed(status) => Err(status.clone()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        self.open().await?;

        let SourceState::Open { stream, .. } = &mut self.state else {
            return Err(RelayError::Eof);
        };
        let next = tokio::select! {
            next = stream.message() => next,
            _ = self.ctx.cancelled() => Err(Status::cancelled("Outbound call cancelled")),
        };

        match next? {
            Some(frame) => Ok(frame),
            None => {
                self.trailers = stream.trailers().await?;
                Err(RelayError::Eof)
            }
        }
    }
}

#[async_trait]
impl BackendSource for ChannelSource {
    async fn header(&mut self) -> Result<MetadataMap, Status> {
        self.open().await?;
        match &self.state {
            SourceState::Open { headers, .. } => Ok(headers.clone()),
            _ => Ok(MetadataMap::new()),
        }
    }

    async fn trailer(&mut self) -> Result<MetadataMap, Status> {
        if let Some(trailers) = &self.trailers {
            return Ok(trailers.clone());
        }
        match &mut self.state {
            SourceState::Open { stream, .. } => Ok(stream.trailers().await?.unwrap_or_default()),
            _ => Ok(MetadataMap::new()),
        }
    }
}
