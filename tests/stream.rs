//! End-to-end tests against a local WebSocket server.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use lens_stream::connection::OUTBOUND_QUEUE_DEPTH;
use lens_stream::{
    Capture, CaptureError, CaptureLoop, CaptureOptions, ConnectionManager, Dispatch, DropReason,
    ErrorKind, ErrorReporter, FramePayload, LinkState, PredictionResult, StreamConfig,
    StreamError,
};

const CAT: &str =
    r#"{"prediction":"cat","probabilities":[0.9,0.1],"class_indices":{"0":"cat","1":"dog"}}"#;
const WAIT: Duration = Duration::from_secs(5);

/// Accept one WebSocket client on a fresh port and hand it to `handler`.
async fn serve<F, Fut>(handler: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        handler(ws).await;
    });
    format!("ws://{addr}/ws")
}

/// Accept one client and never read from it, so its socket fills up.
/// The connection is held until `release` is dropped.
async fn serve_stalled() -> (String, oneshot::Sender<()>) {
    let (release, held) = oneshot::channel::<()>();
    let endpoint = serve(move |ws| async move {
        let _ws = ws;
        let _ = held.await;
    })
    .await;
    (endpoint, release)
}

#[derive(Default)]
struct Collect {
    kinds: Mutex<Vec<ErrorKind>>,
    notify: Notify,
}

impl ErrorReporter for Collect {
    fn report(&self, error: &StreamError) {
        self.kinds.lock().unwrap().push(error.kind());
        self.notify.notify_one();
    }
}

struct StillFrame;

impl Capture for StillFrame {
    fn capture(
        &self,
        _options: &CaptureOptions,
    ) -> impl Future<Output = Result<FramePayload, CaptureError>> + Send {
        std::future::ready(Ok(FramePayload::new(&b"\xFF\xD8still\xFF\xD9"[..])))
    }
}

fn results_channel(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<PredictionResult> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.on_result(move |result| {
        let _ = tx.send(result.clone());
    });
    rx
}

#[tokio::test]
async fn tick_capture_send_and_render() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let endpoint = serve(move |mut ws| async move {
        let mut answered = false;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                let _ = frames_tx.send(data.to_vec());
                // One response for the whole session.
                if !answered {
                    answered = true;
                    if ws.send(Message::text(CAT)).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
    .await;

    let reporter = Arc::new(Collect::default());
    let manager = Arc::new(ConnectionManager::open(
        &StreamConfig::new(endpoint),
        reporter.clone(),
    ));
    let mut results = results_channel(&manager);
    assert_eq!(manager.established().await, LinkState::Open);

    let mut capture_loop = CaptureLoop::spawn(
        Arc::clone(&manager),
        Arc::new(StillFrame),
        CaptureOptions::default(),
        Duration::from_millis(100),
        reporter.clone(),
    );

    let frame = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(frame, b"\xFF\xD8still\xFF\xD9");

    let result = timeout(WAIT, results.recv()).await.unwrap().unwrap();
    assert_eq!(result.label(), Some("cat"));
    assert_eq!(result.probabilities(), Some(&[0.9, 0.1][..]));
    assert_eq!(result.class_indices().unwrap()[&0], "cat");

    // Later frames keep flowing but nothing answers them.
    for _ in 0..2 {
        timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    }
    capture_loop.stop().await;
    manager.close().await;

    assert!(results.try_recv().is_err());
    assert_eq!(manager.latest(), Some(result));
    assert!(capture_loop.stats().sent >= 3);
    assert!(reporter.kinds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn send_goes_out_as_one_binary_message() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let endpoint = serve(move |mut ws| async move {
        while let Some(Ok(msg)) = ws.next().await {
            let _ = frames_tx.send(msg);
        }
    })
    .await;

    let manager = ConnectionManager::open(&StreamConfig::new(endpoint), Arc::new(Collect::default()));
    assert_eq!(manager.established().await, LinkState::Open);

    let outcome = manager.send(FramePayload::new(vec![1u8, 2, 3])).await;
    assert_eq!(outcome, Dispatch::Sent);

    let msg = timeout(WAIT, frames_rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg, Message::binary(vec![1u8, 2, 3]));
    manager.close().await;
}

#[tokio::test]
async fn rejection_reaches_handler_but_keeps_last_prediction() {
    let endpoint = serve(|mut ws| async move {
        ws.send(Message::text(CAT)).await.unwrap();
        ws.send(Message::text(r#"{"error":"No dog detected in the image."}"#))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let manager = ConnectionManager::open(&StreamConfig::new(endpoint), Arc::new(Collect::default()));
    let mut results = results_channel(&manager);

    let first = timeout(WAIT, results.recv()).await.unwrap().unwrap();
    assert_eq!(first.label(), Some("cat"));

    let rejected = timeout(WAIT, results.recv()).await.unwrap().unwrap();
    assert_eq!(rejected.error(), Some("No dog detected in the image."));
    assert!(rejected.label().is_none());

    assert_eq!(manager.latest(), Some(first));
    manager.close().await;
}

#[tokio::test]
async fn malformed_message_keeps_last_result_and_link() {
    let endpoint = serve(|mut ws| async move {
        ws.send(Message::text(CAT)).await.unwrap();
        ws.send(Message::text(r#"{"prediction":"dog","probabil"#))
            .await
            .unwrap();
        ws.send(Message::binary(vec![0u8; 4])).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let reporter = Arc::new(Collect::default());
    let manager = ConnectionManager::open(&StreamConfig::new(endpoint), reporter.clone());
    let mut results = results_channel(&manager);

    let first = timeout(WAIT, results.recv()).await.unwrap().unwrap();
    assert_eq!(first.label(), Some("cat"));

    timeout(WAIT, async {
        while reporter.kinds.lock().unwrap().len() < 2 {
            reporter.notify.notified().await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        *reporter.kinds.lock().unwrap(),
        [ErrorKind::MalformedMessage, ErrorKind::MalformedMessage]
    );
    assert_eq!(manager.latest().and_then(|r| r.label().map(str::to_owned)), Some("cat".into()));
    assert_eq!(manager.link_state(), LinkState::Open);
    assert!(results.try_recv().is_err());
    manager.close().await;
}

#[tokio::test]
async fn server_drop_closes_link_and_stops_sends() {
    let endpoint = serve(|ws| async move {
        drop(ws);
    })
    .await;

    let manager = Arc::new(ConnectionManager::open(
        &StreamConfig::new(endpoint),
        Arc::new(Collect::default()),
    ));
    let mut results = results_channel(&manager);

    let mut link = manager.watch_link();
    timeout(WAIT, link.wait_for(|s| *s == LinkState::Closed))
        .await
        .unwrap()
        .unwrap();

    let outcome = manager.send(FramePayload::new(vec![9u8])).await;
    assert_eq!(outcome, Dispatch::Dropped(DropReason::NotOpen));

    let mut capture_loop = CaptureLoop::spawn(
        Arc::clone(&manager),
        Arc::new(StillFrame),
        CaptureOptions::default(),
        Duration::from_millis(50),
        Arc::new(Collect::default()),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    capture_loop.stop().await;

    let stats = capture_loop.stats();
    assert!(stats.ticks >= 1);
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.captures, 0);
    assert!(results.try_recv().is_err());
    assert_eq!(manager.link_state(), LinkState::Closed);
}

#[tokio::test]
async fn close_twice_sends_one_close_frame() {
    let (closes_tx, closes_rx) = tokio::sync::oneshot::channel();
    let endpoint = serve(move |mut ws| async move {
        let mut closes = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                closes += 1;
            }
        }
        let _ = closes_tx.send(closes);
    })
    .await;

    let manager = ConnectionManager::open(&StreamConfig::new(endpoint), Arc::new(Collect::default()));
    assert_eq!(manager.established().await, LinkState::Open);

    manager.close().await;
    manager.close().await;
    assert_eq!(manager.link_state(), LinkState::Closed);
    assert_eq!(
        manager.send(FramePayload::new(vec![1u8])).await,
        Dispatch::Dropped(DropReason::NotOpen)
    );

    assert_eq!(timeout(WAIT, closes_rx).await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn full_queue_drops_with_backpressure() {
    let (endpoint, release) = serve_stalled().await;
    let config = StreamConfig::new(endpoint).with_write_timeout(Duration::from_millis(300));
    let manager = ConnectionManager::open(&config, Arc::new(Collect::default()));
    assert_eq!(manager.established().await, LinkState::Open);

    // All sends are offered in one poll pass, before the link task runs, so
    // exactly the queue depth gets in.
    let frame = FramePayload::new(vec![0u8; 8 << 20]);
    let outcomes = timeout(WAIT, join_all((0..20).map(|_| manager.send(frame.clone()))))
        .await
        .unwrap();

    let (accepted, refused) = outcomes.split_at(OUTBOUND_QUEUE_DEPTH);
    assert!(refused
        .iter()
        .all(|d| *d == Dispatch::Dropped(DropReason::Backpressure)));
    assert!(accepted
        .iter()
        .all(|d| matches!(d, Dispatch::Sent | Dispatch::Dropped(DropReason::Stalled))));

    timeout(WAIT, manager.close()).await.unwrap();
    drop(release);
}

#[tokio::test]
async fn stalled_write_times_out() {
    let (endpoint, release) = serve_stalled().await;
    let config = StreamConfig::new(endpoint).with_write_timeout(Duration::from_millis(200));
    let manager = ConnectionManager::open(&config, Arc::new(Collect::default()));
    assert_eq!(manager.established().await, LinkState::Open);

    // Far more than loopback socket buffers take, so the write never finishes.
    let frame = FramePayload::new(vec![0u8; 64 << 20]);
    let outcome = timeout(WAIT, manager.send(frame)).await.unwrap();
    assert_eq!(outcome, Dispatch::Dropped(DropReason::Stalled));
    assert_eq!(manager.link_state(), LinkState::Open);

    timeout(WAIT, manager.close()).await.unwrap();
    drop(release);
}

#[tokio::test]
async fn close_drops_queued_frame_as_link_lost() {
    let (endpoint, release) = serve_stalled().await;
    let config = StreamConfig::new(endpoint).with_write_timeout(Duration::from_secs(60));
    let manager = ConnectionManager::open(&config, Arc::new(Collect::default()));
    assert_eq!(manager.established().await, LinkState::Open);

    let frame = FramePayload::new(vec![0u8; 32 << 20]);
    let (outcomes, ()) = timeout(WAIT, async {
        tokio::join!(
            join_all((0..2).map(|_| manager.send(frame.clone()))),
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                manager.close().await;
            },
        )
    })
    .await
    .unwrap();

    // The second frame never left the queue.
    assert_eq!(outcomes[1], Dispatch::Dropped(DropReason::LinkLost));
    assert!(matches!(
        outcomes[0],
        Dispatch::Sent | Dispatch::Dropped(DropReason::LinkLost)
    ));
    assert_eq!(manager.link_state(), LinkState::Closed);
    drop(release);
}
