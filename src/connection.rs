//! Connection manager: one WebSocket to the inference service.
//!
//! A spawned link task owns the socket and is the only writer of the link
//! state and of the last-result slot. The manager handle reads both through
//! `watch` channels and hands outbound frames to the task over a bounded
//! queue. A manager connects at most once; after `Closed` a new manager is
//! needed.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture_loop::Uplink;
use crate::config::StreamConfig;
use crate::error::{ErrorReporter, StreamError};
use crate::frame::FramePayload;
use crate::prediction::PredictionResult;
use crate::transport::{self, WsMessage, WsReader, WsWriter};

/// Frames accepted ahead of the socket before `send` starts dropping.
pub const OUTBOUND_QUEUE_DEPTH: usize = 2;

/// How long `close()` waits to flush the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Connectivity phase of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Open,
    /// Terminal.
    Closed,
}

/// Outcome of one `send` call. Never an error: frames that cannot go out
/// are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The link was not open when `send` was called.
    NotOpen,
    /// The outbound queue was full.
    Backpressure,
    /// The link closed before the frame was written.
    LinkLost,
    /// The socket did not take the frame within the write timeout. It may
    /// still go out later.
    Stalled,
}

type ResultHandler = Arc<dyn Fn(&PredictionResult) + Send + Sync>;

struct Outbound {
    payload: FramePayload,
    ack: oneshot::Sender<Dispatch>,
}

/// Handle to the single link.
pub struct ConnectionManager {
    endpoint: String,
    link: watch::Receiver<LinkState>,
    results: watch::Receiver<Option<PredictionResult>>,
    handler: Arc<RwLock<Option<ResultHandler>>>,
    outbound: mpsc::Sender<Outbound>,
    write_timeout: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start connecting to `config.endpoint`.
    ///
    /// Returns at once in `Disconnected`. Handshake failures are reported and
    /// leave the manager `Closed`. Must be called inside a tokio runtime.
    pub fn open(config: &StreamConfig, reporter: Arc<dyn ErrorReporter>) -> Self {
        let (link_tx, link) = watch::channel(LinkState::Disconnected);
        let (results_tx, results) = watch::channel(None);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let handler: Arc<RwLock<Option<ResultHandler>>> = Arc::default();
        let cancel = CancellationToken::new();

        let task = LinkTask {
            endpoint: config.endpoint.clone(),
            pinned_cert: config.pinned_cert.clone(),
            link: link_tx,
            results: results_tx,
            handler: Arc::clone(&handler),
            reporter,
        };
        let handle = tokio::spawn(task.run(outbound_rx, cancel.clone()));

        ConnectionManager {
            endpoint: config.endpoint.clone(),
            link,
            results,
            handler,
            outbound,
            write_timeout: config.write_timeout,
            cancel,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Wait until the link leaves `Disconnected`, returning the new state.
    pub async fn established(&self) -> LinkState {
        let mut link = self.link.clone();
        let state = match link.wait_for(|s| *s != LinkState::Disconnected).await {
            Ok(state) => *state,
            Err(_) => LinkState::Closed,
        };
        state
    }

    /// Transmit one frame as a single binary message.
    ///
    /// Drops the frame (and says why) unless the link is open and the
    /// outbound queue has room. Nothing is retried or buffered beyond the
    /// queue. Waits at most `write_timeout` for the socket to take the frame.
    pub async fn send(&self, payload: FramePayload) -> Dispatch {
        if self.link_state() != LinkState::Open {
            tracing::trace!("link not open, dropping {} byte frame", payload.len());
            return Dispatch::Dropped(DropReason::NotOpen);
        }

        let (ack, ack_rx) = oneshot::channel();
        match self.outbound.try_send(Outbound { payload, ack }) {
            Ok(()) => {}
            Err(TrySendError::Full(out)) => {
                tracing::warn!(
                    "outbound queue full, dropping {} byte frame",
                    out.payload.len()
                );
                return Dispatch::Dropped(DropReason::Backpressure);
            }
            Err(TrySendError::Closed(_)) => return Dispatch::Dropped(DropReason::LinkLost),
        }
        match tokio::time::timeout(self.write_timeout, ack_rx).await {
            Ok(ack) => ack.unwrap_or(Dispatch::Dropped(DropReason::LinkLost)),
            Err(_) => {
                tracing::warn!("frame not written within {:?}", self.write_timeout);
                Dispatch::Dropped(DropReason::Stalled)
            }
        }
    }

    /// Register the result handler, replacing any previous one.
    pub fn on_result<F>(&self, handler: F)
    where
        F: Fn(&PredictionResult) + Send + Sync + 'static,
    {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Last classification received, if any. Rejections go to the handler
    /// but leave this slot alone.
    pub fn latest(&self) -> Option<PredictionResult> {
        self.results.borrow().clone()
    }

    pub fn subscribe_results(&self) -> watch::Receiver<Option<PredictionResult>> {
        self.results.clone()
    }

    /// Close the link and release the socket. Safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("link task for {} failed: {}", self.endpoint, e);
            }
        }
        let mut link = self.link.clone();
        let _ = link.wait_for(|s| *s == LinkState::Closed).await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Uplink for ConnectionManager {
    fn link_state(&self) -> LinkState {
        ConnectionManager::link_state(self)
    }

    fn watch_link(&self) -> watch::Receiver<LinkState> {
        ConnectionManager::watch_link(self)
    }

    fn send(&self, payload: FramePayload) -> impl Future<Output = Dispatch> + Send {
        ConnectionManager::send(self, payload)
    }
}

/// State owned by the spawned link task.
struct LinkTask {
    endpoint: String,
    pinned_cert: Option<Vec<u8>>,
    link: watch::Sender<LinkState>,
    results: watch::Sender<Option<PredictionResult>>,
    handler: Arc<RwLock<Option<ResultHandler>>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl LinkTask {
    async fn run(self, mut outbound: mpsc::Receiver<Outbound>, cancel: CancellationToken) {
        tracing::info!("Connecting to {}", self.endpoint);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Link to {} closed before opening", self.endpoint);
                self.link.send_replace(LinkState::Closed);
                return;
            }
            res = transport::connect(&self.endpoint, self.pinned_cert.as_deref()) => res,
        };

        match connected {
            Ok((writer, reader)) => {
                self.link.send_replace(LinkState::Open);
                tracing::info!("Link open to {}", self.endpoint);
                self.pump(writer, reader, &mut outbound, &cancel).await;
            }
            Err(e) => self.reporter.report(&e),
        }

        self.link.send_replace(LinkState::Closed);
        outbound.close();
        while let Ok(out) = outbound.try_recv() {
            let _ = out.ack.send(Dispatch::Dropped(DropReason::LinkLost));
        }
        tracing::info!("Link to {} closed", self.endpoint);
    }

    /// Forward frames out and results in until either side ends the link.
    async fn pump(
        &self,
        mut writer: WsWriter,
        mut reader: WsReader,
        outbound: &mut mpsc::Receiver<Outbound>,
        cancel: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.send_close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::debug!("close frame not delivered: {}", e),
                        Err(_) => tracing::debug!("close frame not flushed, dropping socket"),
                    }
                    return;
                }
                Some(out) = outbound.recv() => {
                    let len = out.payload.len();
                    // A peer that stops reading must not block close().
                    let written = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::debug!("close interrupted a {} byte write", len);
                            return;
                        }
                        res = writer.send_binary(out.payload.into_bytes()) => res,
                    };
                    match written {
                        Ok(()) => {
                            tracing::debug!("sent {} byte frame", len);
                            let _ = out.ack.send(Dispatch::Sent);
                        }
                        Err(e) => {
                            self.reporter.report(&e);
                            let _ = out.ack.send(Dispatch::Dropped(DropReason::LinkLost));
                            return;
                        }
                    }
                }
                msg = reader.recv() => match msg {
                    None => {
                        tracing::info!("server ended the stream");
                        return;
                    }
                    Some(Err(e)) => {
                        self.reporter.report(&e);
                        return;
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        tracing::info!("server closed the link ({}): {}", code, reason);
                        return;
                    }
                    Some(Ok(WsMessage::Text(text))) => self.deliver(&text),
                    Some(Ok(WsMessage::Binary(data))) => {
                        self.reporter.report(&StreamError::UnexpectedBinary(data.len()));
                    }
                    Some(Ok(WsMessage::Ping | WsMessage::Pong)) => {}
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        let result = match PredictionResult::decode(text) {
            Ok(result) => result,
            Err(e) => {
                self.reporter.report(&e);
                return;
            }
        };

        match &result {
            PredictionResult::Classified(p) => {
                tracing::info!(label = %p.label, "Prediction received");
                tracing::debug!("probabilities: {:?}", p.probabilities);
            }
            PredictionResult::Rejected { error } => {
                tracing::info!("Server returned no prediction: {}", error);
            }
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let PredictionResult::Classified(_) = &result {
            self.results.send_replace(Some(result.clone()));
        }
        if let Some(handler) = handler {
            handler(&result);
        }
    }
}
