//! In-memory stream pairs for exercising the proxy without a network
//!
//! [`FakeTransport`] hands every opened stream to the test as a
//! [`BackendCall`], which plays the backend. [`fake_caller`] builds the
//! inbound side and records what the caller would observe.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tonic::metadata::MetadataMap;

use super::codec::Frame;
use super::pool::Connector;
use super::stream::{BackendSink, BackendSource, CallerSink, FrameSink, FrameSource, Transport};
use crate::context::CallContext;
use crate::error::{PoolError, RelayError};

const BUFFER: usize = 16;

/// Backend end of one opened stream
pub struct BackendCall {
    pub method: String,
    pub ctx: CallContext,
    /// Request frames; `None` once the proxy half-closed
    pub requests: mpsc::Receiver<Frame>,
    headers: Option<oneshot::Sender<MetadataMap>>,
    responses: Option<mpsc::Sender<Result<Frame, Status>>>,
    trailers: Arc<Mutex<MetadataMap>>,
}

impl BackendCall {
    pub fn send_header(&mut self, headers: MetadataMap) {
        if let Some(tx) = self.headers.take() {
            let _ = tx.send(headers);
        }
    }

    /// Send one response frame; empty headers go first if none were sent
    pub async fn send(&mut self, frame: Frame) {
        self.send_header(MetadataMap::new());
        if let Some(tx) = &self.responses {
            let _ = tx.send(Ok(frame)).await;
        }
    }

    /// Finish the response stream successfully with `trailers`
    pub fn finish(mut self, trailers: MetadataMap) {
        *self.trailers.lock().unwrap() = trailers;
        self.headers.take();
        self.responses.take();
    }

    /// Fail the response stream with `status`
    pub async fn fail(mut self, status: Status) {
        self.headers.take();
        if let Some(tx) = self.responses.take() {
            let _ = tx.send(Err(status)).await;
        }
    }
}

#[derive(Clone)]
pub struct FakeTransport {
    calls: mpsc::UnboundedSender<BackendCall>,
}

impl FakeTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }
}

impl Transport for FakeTransport {
    type Sink = FakeSink;
    type Source = FakeSource;

    fn open_stream(
        &self,
        ctx: &CallContext,
        method: &str,
    ) -> Result<(Self::Sink, Self::Source), Status> {
        let (req_tx, req_rx) = mpsc::channel(BUFFER);
        let (resp_tx, resp_rx) = mpsc::channel(BUFFER);
        let (header_tx, header_rx) = oneshot::channel();
        let trailers = Arc::new(Mutex::new(MetadataMap::new()));

        self.calls
            .send(BackendCall {
                method: method.to_string(),
                ctx: ctx.clone(),
                requests: req_rx,
                headers: Some(header_tx),
                responses: Some(resp_tx),
                trailers: trailers.clone(),
            })
            .map_err(|_| Status::unavailable("fake backend is gone"))?;

        let source = FakeSource {
            ctx: ctx.clone(),
            responses: resp_rx,
            header_rx: Some(header_rx),
            headers: None,
            trailers,
        };
        Ok((FakeSink { tx: Some(req_tx) }, source))
    }
}

pub struct FakeSink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::Eof)?;
        tx.send(frame).await.map_err(|_| RelayError::Eof)
    }
}

#[async_trait]
impl BackendSink for FakeSink {
    async fn close_send(&mut self) {
        self.tx = None;
    }
}

pub struct FakeSource {
    ctx: CallContext,
    responses: mpsc::Receiver<Result<Frame, Status>>,
    header_rx: Option<oneshot::Receiver<MetadataMap>>,
    headers: Option<MetadataMap>,
    trailers: Arc<Mutex<MetadataMap>>,
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        tokio::select! {
            next = self.responses.recv() => match next {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(status)) => Err(RelayError::Status(status)),
                None => Err(RelayError::Eof),
            },
            _ = self.ctx.cancelled() => {
                Err(RelayError::Status(Status::cancelled("outbound call cancelled")))
            }
        }
    }
}

#[async_trait]
impl BackendSource for FakeSource {
    async fn header(&mut self) -> Result<MetadataMap, Status> {
        if let Some(rx) = self.header_rx.take() {
            self.headers = Some(rx.await.unwrap_or_default());
        }
        Ok(self.headers.clone().unwrap_or_default())
    }

    async fn trailer(&mut self) -> Result<MetadataMap, Status> {
        Ok(self.trailers.lock().unwrap().clone())
    }
}

/// Connector that dials [`FakeTransport`] clones, optionally failing
pub struct FakeConnector {
    transport: FakeTransport,
    failure: Option<PoolError>,
}

impl FakeConnector {
    pub fn new(transport: FakeTransport) -> Self {
        Self {
            transport,
            failure: None,
        }
    }

    pub fn failing(transport: FakeTransport, failure: PoolError) -> Self {
        Self {
            transport,
            failure: Some(failure),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeTransport;

    async fn connect(&self) -> Result<FakeTransport, PoolError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.transport.clone()),
        }
    }
}

/// What the caller observed, in order
#[derive(Debug, Clone)]
pub enum CallerEvent {
    Header(MetadataMap),
    Frame(Frame),
}

/// Inbound request stream fed by the test
pub struct FakeCallerSource {
    rx: mpsc::Receiver<Result<Frame, Status>>,
}

#[async_trait]
impl FrameSource for FakeCallerSource {
    async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(status)) => Err(RelayError::Status(status)),
            None => Err(RelayError::Eof),
        }
    }
}

/// Inbound response side recording every event
pub struct FakeCallerSink {
    events: mpsc::UnboundedSender<CallerEvent>,
    header_sent: bool,
    trailers: Arc<Mutex<Option<MetadataMap>>>,
}

#[async_trait]
impl FrameSink for FakeCallerSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError> {
        self.events
            .send(CallerEvent::Frame(frame))
            .map_err(|_| RelayError::Eof)
    }
}

impl CallerSink for FakeCallerSink {
    fn send_header(&mut self, headers: MetadataMap) -> Result<(), Status> {
        if self.header_sent {
            return Err(Status::internal("headers already sent"));
        }
        self.header_sent = true;
        self.events
            .send(CallerEvent::Header(headers))
            .map_err(|_| Status::cancelled("caller is gone"))
    }

    fn set_trailer(&mut self, trailers: MetadataMap) {
        *self.trailers.lock().unwrap() = Some(trailers);
    }
}

/// Test-side handles of the fake caller
pub struct CallerView {
    requests: Option<mpsc::Sender<Result<Frame, Status>>>,
    pub events: mpsc::UnboundedReceiver<CallerEvent>,
    trailers: Arc<Mutex<Option<MetadataMap>>>,
}

impl CallerView {
    pub async fn send(&self, request: Result<Frame, Status>) {
        if let Some(tx) = &self.requests {
            tx.send(request).await.unwrap();
        }
    }

    /// Another handle on the request stream
    pub fn sender(&self) -> mpsc::Sender<Result<Frame, Status>> {
        self.requests.clone().unwrap()
    }

    /// Finish sending requests from this handle
    pub fn close(&mut self) {
        self.requests = None;
    }

    pub fn trailers(&self) -> Option<MetadataMap> {
        self.trailers.lock().unwrap().clone()
    }

    pub fn drain(&mut self) -> Vec<CallerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn fake_caller() -> (FakeCallerSource, FakeCallerSink, CallerView) {
    let (req_tx, req_rx) = mpsc::channel(BUFFER);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let trailers = Arc::new(Mutex::new(None));
    (
        FakeCallerSource { rx: req_rx },
        FakeCallerSink {
            events: event_tx,
            header_sent: false,
            trailers: trailers.clone(),
        },
        CallerView {
            requests: Some(req_tx),
            events: event_rx,
            trailers,
        },
    )
}

pub fn metadata(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
    let mut md = MetadataMap::new();
    for (key, value) in pairs {
        md.insert(*key, value.parse().unwrap());
    }
    md
}

pub fn frame(bytes: &'static [u8]) -> Frame {
    Frame::new(bytes)
}
