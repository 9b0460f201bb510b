//! Stream capabilities the forwarder relays through
//!
//! The forwarder never touches a tonic stream directly. It works against
//! these halves, which the transport module implements over tonic and the
//! tests implement in memory.

use async_trait::async_trait;
use tonic::Status;
use tonic::metadata::MetadataMap;

use super::codec::Frame;
use crate::context::CallContext;
use crate::error::RelayError;

/// Receiving half of a stream
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or [`RelayError::Eof`] once the peer finished sending
    async fn recv_frame(&mut self) -> Result<Frame, RelayError>;
}

/// Sending half of a stream
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Relay one frame; [`RelayError::Eof`] means the peer stopped reading
    async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError>;
}

/// Response side of the inbound call, towards the caller
pub trait CallerSink: FrameSink {
    /// Response headers; must precede the first frame and may be sent once
    fn send_header(&mut self, headers: MetadataMap) -> Result<(), Status>;

    /// Trailers delivered with the final status
    fn set_trailer(&mut self, trailers: MetadataMap);
}

/// Request side of the outbound call, towards the backend
#[async_trait]
pub trait BackendSink: FrameSink {
    /// Half-close: no more requests will be sent
    async fn close_send(&mut self);
}

/// Response side of the outbound call, from the backend
#[async_trait]
pub trait BackendSource: FrameSource {
    /// Backend response headers, waiting for them if necessary
    async fn header(&mut self) -> Result<MetadataMap, Status>;

    /// Backend trailers; only meaningful after [`RelayError::Eof`]
    async fn trailer(&mut self) -> Result<MetadataMap, Status>;
}

/// A connection that can open outbound streams to the backend
pub trait Transport: Clone + Send + Sync + 'static {
    type Sink: BackendSink;
    type Source: BackendSource;

    /// Open a full-duplex stream for `method`, carrying the context's metadata.
    ///
    /// The stream stops with `Cancelled` once `ctx` is cancelled.
    fn open_stream(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<(Self::Sink, Self::Source), Status>;
}
