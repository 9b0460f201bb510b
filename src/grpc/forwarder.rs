//! Call-lifetime engine of the proxy
//!
//! For every inbound call the forwarder asks the director for a destination,
//! opens an outbound stream for the same method and then either relays frames
//! in both directions until the backend finishes, or, for the download URL
//! lookup, performs a single request/response exchange and rewrites the URL
//! on the way back.
//!
//! Generic relay runs two pumps on a [`JoinSet`]:
//!
//! - **requests**: caller → backend. End of stream half-closes the backend
//!   send side and the call keeps going.
//! - **responses**: backend → caller. Forwards the backend headers before the
//!   first frame; end of stream copies the backend trailers and ends the call.
//!
//! The first pump result that ends the call wins. Any exit cancels the
//! outbound context and returns the pooled connection.

use std::time::Instant;
use tokio::task::JoinSet;
use tonic::Status;
use tracing::instrument;

use super::codec::Frame;
use super::director::{Destination, Director};
use super::download::DownloadUrlResponse;
use super::rewrite::UrlRewriter;
use super::stream::{BackendSink, BackendSource, CallerSink, FrameSink, FrameSource, Transport};
use crate::context::{CallContext, CancelHandle};
use crate::error::RelayError;

pub struct Forwarder<D: Director> {
    director: D,
    rewriter: UrlRewriter,
    intercepted_method: String,
}

/// Metric label for calls that never reached a method the backend serves
const UNKNOWN_METHOD: &str = "unknown";

/// Method paths come from callers, so only ones the backend actually served
/// become metric labels
fn metric_label(method: &str, resolved: bool, code: tonic::Code) -> &str {
    if resolved && code != tonic::Code::Unimplemented {
        method
    } else {
        UNKNOWN_METHOD
    }
}

enum Pump {
    Requests(Result<(), RelayError>),
    Responses(Result<(), RelayError>),
}

impl<D: Director> Forwarder<D> {
    pub fn new(director: D, rewriter: UrlRewriter, intercepted_method: impl Into<String>) -> Self {
        Self {
            director,
            rewriter,
            intercepted_method: intercepted_method.into(),
        }
    }

    pub fn director(&self) -> &D {
        &self.director
    }

    /// Proxy one inbound call to completion.
    ///
    /// `Ok` means the backend finished successfully and its trailers were
    /// handed to `caller_tx`; any `Err` is the call's terminal status.
    #[instrument(skip_all, fields(method = %method))]
    pub async fn handle<S, K>(
        &self,
        ctx: &CallContext,
        method: &str,
        caller_rx: S,
        caller_tx: K,
    ) -> Result<(), Status>
    where
        S: FrameSource,
        K: CallerSink,
    {
        let started = Instant::now();

        let (resolved, result) = match self.director.resolve(ctx, method).await {
            Ok(destination) => {
                let result = tokio::select! {
                    result = self.forward(destination, method, caller_rx, caller_tx) => result,
                    _ = ctx.cancelled() => Err(Status::cancelled("Call cancelled")),
                };
                (true, result)
            }
            Err(status) => (false, Err(status)),
        };

        let code = match &result {
            Ok(()) => tonic::Code::Ok,
            Err(status) => status.code(),
        };
        crate::metrics::record_call(metric_label(method, resolved, code), code, started.elapsed());

        match &result {
            Ok(()) => tracing::debug!(elapsed_ms = started.elapsed().as_millis(), "Call completed"),
            Err(status) => tracing::info!(
                code = ?status.code(),
                error = status.message(),
                "Call ended with error"
            ),
        }
        result
    }

    async fn forward<S, K>(
        &self,
        destination: Destination<D::Conn>,
        method: &str,
        caller_rx: S,
        caller_tx: K,
    ) -> Result<(), Status>
    where
        S: FrameSource,
        K: CallerSink,
    {
        // Dropped on return: cancels the outbound call and releases the connection
        let Destination {
            ctx: out_ctx,
            cancel,
            conn,
        } = destination;

        let (backend_tx, backend_rx) = conn.value().open_stream(&out_ctx, method)?;

        if method == self.intercepted_method {
            self.intercept(caller_rx, caller_tx, backend_tx, backend_rx)
                .await
        } else {
            relay(&out_ctx, &cancel, caller_rx, caller_tx, backend_tx, backend_rx).await
        }
    }

    /// Unary exchange with the download URL rewritten in the response
    async fn intercept<S, K, BS, BR>(
        &self,
        mut caller_rx: S,
        mut caller_tx: K,
        mut backend_tx: BS,
        mut backend_rx: BR,
    ) -> Result<(), Status>
    where
        S: FrameSource,
        K: CallerSink,
        BS: BackendSink,
        BR: BackendSource,
    {
        let request = caller_rx
            .recv_frame()
            .await
            .map_err(|e| e.into_status("Missing download URL request"))?;
        request
            .decode::<()>()
            .map_err(|e| Status::invalid_argument(format!("Malformed download URL request: {}", e)))?;

        match backend_tx.send_frame(Frame::encode(&())).await {
            // A backend that stopped reading reports why on the response side
            Ok(()) | Err(RelayError::Eof) => {}
            Err(RelayError::Status(status)) => return Err(status),
        }
        backend_tx.close_send().await;

        let response = backend_rx
            .recv_frame()
            .await
            .map_err(|e| e.into_status("Backend returned no download URL response"))?;
        let mut response: DownloadUrlResponse = response.decode().map_err(|e| {
            Status::internal(format!("Malformed download URL response from backend: {}", e))
        })?;

        let original = std::mem::take(&mut response.url);
        response.url = self.rewriter.rewrite(&original);
        tracing::debug!(from = %original, to = %response.url, "Rewrote download URL");
        crate::metrics::record_url_rewrite();

        caller_tx.send_header(backend_rx.header().await?)?;
        caller_tx
            .send_frame(Frame::encode(&response))
            .await
            .map_err(|e| e.into_status("Caller stopped receiving"))?;

        // Trailers only exist once the backend finished
        loop {
            match backend_rx.recv_frame().await {
                Ok(_) => tracing::warn!("Dropping extra frame after download URL response"),
                Err(RelayError::Eof) => break,
                Err(RelayError::Status(status)) => return Err(status),
            }
        }
        caller_tx.set_trailer(backend_rx.trailer().await?);
        Ok(())
    }
}

async fn relay<S, K, BS, BR>(
    ctx: &CallContext,
    cancel: &CancelHandle,
    caller_rx: S,
    caller_tx: K,
    backend_tx: BS,
    backend_rx: BR,
) -> Result<(), Status>
where
    S: FrameSource,
    K: CallerSink,
    BS: BackendSink,
    BR: BackendSource,
{
    let mut pumps = JoinSet::new();
    pumps.spawn(async move { Pump::Requests(pump_requests(caller_rx, backend_tx).await) });
    pumps.spawn(async move { Pump::Responses(pump_responses(backend_rx, caller_tx).await) });

    let result = loop {
        let joined = tokio::select! {
            joined = pumps.join_next() => joined,
            _ = ctx.cancelled() => break Err(Status::cancelled("Call cancelled")),
        };

        match joined {
            Some(Ok(Pump::Requests(Ok(())))) => {
                tracing::debug!("Caller finished sending");
            }
            Some(Ok(Pump::Requests(Err(e)))) => {
                cancel.cancel();
                break Err(Status::internal(format!(
                    "Failed relaying request to backend: {}",
                    e
                )));
            }
            Some(Ok(Pump::Responses(Ok(())))) => break Ok(()),
            Some(Ok(Pump::Responses(Err(e)))) => {
                cancel.cancel();
                break Err(e.into_status("Backend response stream ended unexpectedly"));
            }
            Some(Err(e)) => {
                cancel.cancel();
                break Err(Status::internal(format!("Relay task failed: {}", e)));
            }
            None => break Err(Status::internal("Relay ended without a terminal status")),
        }
    };

    pumps.shutdown().await;
    result
}

/// Caller → backend until the caller finishes; then half-close the backend
async fn pump_requests<S, B>(mut caller: S, mut backend: B) -> Result<(), RelayError>
where
    S: FrameSource,
    B: BackendSink,
{
    let ended = loop {
        let frame = match caller.recv_frame().await {
            Ok(frame) => frame,
            Err(e) => break e,
        };
        if let Err(e) = backend.send_frame(frame).await {
            break e;
        }
    };

    if ended.is_eof() {
        backend.close_send().await;
        Ok(())
    } else {
        Err(ended)
    }
}

/// Backend → caller until the backend finishes, headers first and trailers last
async fn pump_responses<B, K>(mut backend: B, mut caller: K) -> Result<(), RelayError>
where
    B: BackendSource,
    K: CallerSink,
{
    let mut header_sent = false;
    loop {
        match backend.recv_frame().await {
            Ok(frame) => {
                if !header_sent {
                    caller.send_header(backend.header().await?)?;
                    header_sent = true;
                }
                caller.send_frame(frame).await.map_err(|e| match e {
                    RelayError::Eof => {
                        RelayError::Status(Status::cancelled("Caller stopped receiving"))
                    }
                    other => other,
                })?;
            }
            Err(RelayError::Eof) => {
                if !header_sent {
                    caller.send_header(backend.header().await?)?;
                }
                caller.set_trailer(backend.trailer().await?);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
