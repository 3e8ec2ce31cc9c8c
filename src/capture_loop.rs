//! Fixed-interval capture loop.
//!
//! Every tick, if the link is open and no earlier cycle is still running, one
//! frame is captured and handed to the uplink. Ticks that find the link
//! closed or a cycle in flight are skipped and counted, never queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::capture::Capture;
use crate::connection::{Dispatch, LinkState};
use crate::error::{ErrorReporter, StreamError};
use crate::frame::{CaptureOptions, FramePayload};

/// What the loop needs from the connection: read the link state and send.
pub trait Uplink: Send + Sync + 'static {
    fn link_state(&self) -> LinkState;
    fn watch_link(&self) -> watch::Receiver<LinkState>;
    fn send(&self, payload: FramePayload) -> impl Future<Output = Dispatch> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Link not open.
    Idle,
    /// Link open, waiting for the next tick.
    Armed,
    /// One capture+send cycle running.
    Capturing,
}

/// Counter snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub skipped_not_open: u64,
    pub skipped_busy: u64,
    pub captures: u64,
    pub capture_failures: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    skipped_not_open: AtomicU64,
    skipped_busy: AtomicU64,
    captures: AtomicU64,
    capture_failures: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LoopStats {
        LoopStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_not_open: self.skipped_not_open.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running capture loop.
pub struct CaptureLoop {
    cancel: CancellationToken,
    phase: watch::Receiver<LoopPhase>,
    counters: Arc<Counters>,
    timer: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// Start ticking. The first tick fires one `interval` from now.
    pub fn spawn<U: Uplink, C: Capture>(
        uplink: Arc<U>,
        capture: Arc<C>,
        options: CaptureOptions,
        interval: Duration,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (phase_tx, phase) = watch::channel(LoopPhase::Idle);
        let counters = Arc::new(Counters::default());

        let shared = Arc::new(Shared {
            uplink,
            capture,
            options,
            reporter,
            in_flight: AtomicBool::new(false),
            phase: phase_tx,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        });
        let link = shared.uplink.watch_link();
        shared.refresh_phase();
        let first_tick = Instant::now() + interval;
        let timer = tokio::spawn(run_timer(shared, link, first_tick, interval));

        CaptureLoop {
            cancel,
            phase,
            counters,
            timer: Some(timer),
        }
    }

    pub fn phase(&self) -> LoopPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<LoopPhase> {
        self.phase.clone()
    }

    pub fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// Cancel all future ticks. A cycle already in flight runs to completion.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(timer) = self.timer.take() {
            if let Err(e) = timer.await {
                tracing::error!("capture timer failed: {}", e);
            }
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Shared<U, C> {
    uplink: Arc<U>,
    capture: Arc<C>,
    options: CaptureOptions,
    reporter: Arc<dyn ErrorReporter>,
    in_flight: AtomicBool,
    phase: watch::Sender<LoopPhase>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

/// Clears the in-flight flag when a cycle ends, even by panic.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_timer<U: Uplink, C: Capture>(
    shared: Arc<Shared<U, C>>,
    mut link: watch::Receiver<LinkState>,
    first_tick: Instant,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut watching = true;
    let cancel = shared.cancel.clone();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = link.changed(), if watching => {
                // Sender gone: the link can never change again.
                watching = changed.is_ok();
                shared.refresh_phase();
            }
            _ = ticker.tick() => shared.tick(),
        }
    }
    shared.phase.send_replace(LoopPhase::Idle);
    tracing::debug!("capture timer stopped");
}

impl<U: Uplink, C: Capture> Shared<U, C> {
    fn tick(self: &Arc<Self>) {
        Counters::bump(&self.counters.ticks);

        if self.uplink.link_state() != LinkState::Open {
            Counters::bump(&self.counters.skipped_not_open);
            tracing::trace!("link not open, skipping tick");
            self.refresh_phase();
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            Counters::bump(&self.counters.skipped_busy);
            tracing::debug!("previous capture still in flight, skipping tick");
            return;
        }

        self.phase.send_replace(LoopPhase::Capturing);
        tokio::spawn(Arc::clone(self).cycle());
    }

    async fn cycle(self: Arc<Self>) {
        {
            let _guard = InFlight(&self.in_flight);
            match self.capture.capture(&self.options).await {
                Ok(frame) => {
                    Counters::bump(&self.counters.captures);
                    match self.uplink.send(frame).await {
                        Dispatch::Sent => Counters::bump(&self.counters.sent),
                        Dispatch::Dropped(reason) => {
                            Counters::bump(&self.counters.dropped);
                            tracing::debug!(?reason, "captured frame dropped");
                        }
                    }
                }
                Err(e) => {
                    Counters::bump(&self.counters.capture_failures);
                    self.reporter.report(&StreamError::Capture(e));
                }
            }
        }
        self.refresh_phase();
    }

    fn refresh_phase(&self) {
        let phase = if self.cancel.is_cancelled() || self.uplink.link_state() != LinkState::Open
        {
            LoopPhase::Idle
        } else if self.in_flight.load(Ordering::Acquire) {
            LoopPhase::Capturing
        } else {
            LoopPhase::Armed
        };
        self.phase.send_replace(phase);
    }
}
