use crate::config::ClientConfig;
use crate::errors::{AppError, Result};
use crate::feed::reconnect::ReconnectScheduler;
use crate::feed::session::{QuoteSession, SessionCommand, SessionEvent};
use crate::models::ClientSnapshot;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SnapshotCallback = Box<dyn FnMut(ClientSnapshot) + Send>;

const NO_SESSION: u64 = 0;
/// How long a deliberate close waits for the server's closing frame.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Streams the latest quote for one symbol and keeps reconnecting until told
/// to stop or the retry budget runs out.
///
/// A client owns at most one live session at a time.
#[derive(Debug)]
pub struct StreamingQuoteClient {
    config: ClientConfig,
    active_session: Arc<AtomicU64>,
    next_session_id: AtomicU64,
    /// Fires once the last session's driver has let go of its socket.
    last_release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl StreamingQuoteClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            active_session: Arc::new(AtomicU64::new(NO_SESSION)),
            next_session_id: AtomicU64::new(NO_SESSION + 1),
            last_release: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a session and return the handle that ends it.
    ///
    /// The initial `Connecting` snapshot is delivered before this returns;
    /// everything after that is delivered from a background task, in order.
    /// Must be called from within a tokio runtime.
    ///
    /// The new session does not connect until the previous session of this
    /// client has closed its socket.
    pub fn activate<F>(&self, on_snapshot: F) -> Result<SessionHandle>
    where
        F: FnMut(ClientSnapshot) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::Runtime(e.to_string()))?;

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        if self
            .active_session
            .compare_exchange(NO_SESSION, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::LifecycleMisuse(
                "client already has an active session; deactivate it first".into(),
            ));
        }
        let slot = SessionSlot {
            active: self.active_session.clone(),
            id,
        };

        let sink = Arc::new(SnapshotSink::new(Box::new(on_snapshot)));
        let mut session = QuoteSession::new(
            self.config.symbol.clone(),
            ReconnectScheduler::new(self.config.reconnect.clone()),
        );
        let initial = session.start();
        if let Some(snapshot) = initial.snapshot {
            sink.publish(snapshot);
        }

        let (released_tx, released_rx) = oneshot::channel();
        let previous = self
            .last_release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(released_rx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = SessionDriver {
            endpoint: self.config.endpoint.clone(),
            connect_timeout: self.config.connect_timeout,
            session,
            sink: sink.clone(),
            slot: slot.clone(),
            link: Link::Idle,
            released: released_tx,
        };
        let task = runtime.spawn(driver.run(initial.commands, previous, shutdown_rx));

        Ok(SessionHandle {
            sink,
            shutdown: Some(shutdown_tx),
            slot,
            task: Some(task),
        })
    }

    /// Like [`activate`](Self::activate), but snapshots land in a `watch` channel.
    ///
    /// The sender side is dropped when the session ends, so `changed()` on the
    /// receiver returns an error after the final snapshot.
    pub fn activate_watch(&self) -> Result<(SessionHandle, watch::Receiver<ClientSnapshot>)> {
        let (tx, rx) = watch::channel(ClientSnapshot::default());
        let handle = self.activate(move |snapshot| {
            tx.send_replace(snapshot);
        })?;
        Ok((handle, rx))
    }
}

/// Owned token for one activated session. Dropping it deactivates the session.
pub struct SessionHandle {
    sink: Arc<SnapshotSink>,
    shutdown: Option<oneshot::Sender<()>>,
    slot: SessionSlot,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Stop the session: no snapshot is delivered once this returns, the
    /// pending retry (if any) is cancelled and the connection is closed with
    /// code 1000. Calling it again does nothing.
    ///
    /// Safe to call (or to drop the handle) from inside the session's own
    /// snapshot callback; the callback is then dropped as soon as it returns.
    /// The socket itself is closed by the background task, see
    /// [`shutdown`](Self::shutdown) to wait for that.
    pub fn deactivate(&mut self) {
        self.sink.release();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            debug!("[FEED] session deactivated");
        }
        self.slot.release();
    }

    /// Whether snapshots can still be delivered.
    pub fn is_active(&self) -> bool {
        !self.sink.is_released()
    }

    /// Deactivate and wait until the connection has been released.
    pub async fn shutdown(mut self) {
        self.deactivate();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "[FEED] session task ended abnormally");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.slot.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Claim on the client's single session slot.
#[derive(Debug, Clone)]
struct SessionSlot {
    active: Arc<AtomicU64>,
    id: u64,
}

impl SessionSlot {
    fn release(&self) {
        let _ = self.active.compare_exchange(
            self.id,
            NO_SESSION,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Consumer callback. Emptied exactly once, after which publishing is a no-op.
///
/// The callback runs under `callback`'s lock, so a release from another thread
/// waits for a running callback to finish. A release from inside the callback
/// only raises `released`; `publish` drops the callback once it returns.
struct SnapshotSink {
    callback: Mutex<Option<SnapshotCallback>>,
    released: AtomicBool,
    publisher: Mutex<Option<ThreadId>>,
}

impl SnapshotSink {
    fn new(callback: SnapshotCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            released: AtomicBool::new(false),
            publisher: Mutex::new(None),
        }
    }

    fn publish(&self, snapshot: ClientSnapshot) -> bool {
        let mut guard = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        let delivered = match guard.as_mut() {
            Some(callback) if !self.is_released() => {
                self.set_publisher(Some(thread::current().id()));
                callback(snapshot);
                self.set_publisher(None);
                true
            }
            _ => false,
        };
        if self.is_released() {
            // Dropped outside the lock: the callback may own a handle whose
            // drop releases this sink again.
            let stale = guard.take();
            drop(guard);
            drop(stale);
        }
        delivered
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        let reentrant = *self.publisher.lock().unwrap_or_else(PoisonError::into_inner)
            == Some(thread::current().id());
        if reentrant {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(callback);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn set_publisher(&self, id: Option<ThreadId>) {
        *self.publisher.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }
}

/// What the driver is currently waiting on.
enum Link {
    Idle,
    Connecting(BoxFuture<'static, Result<WsStream>>),
    Open(WsStream),
    Waiting(Pin<Box<Sleep>>),
}

/// Runs one session: turns socket and timer activity into [`SessionEvent`]s
/// and carries out the resulting [`SessionCommand`]s, one step at a time.
struct SessionDriver {
    endpoint: String,
    connect_timeout: Duration,
    session: QuoteSession,
    sink: Arc<SnapshotSink>,
    slot: SessionSlot,
    link: Link,
    released: oneshot::Sender<()>,
}

impl SessionDriver {
    async fn run(
        mut self,
        initial: Vec<SessionCommand>,
        previous: Option<oneshot::Receiver<()>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut pending = VecDeque::new();
        let ready = match previous {
            // A dropped sender means that driver is gone too.
            Some(previous) => tokio::select! {
                biased;
                _ = &mut shutdown => false,
                _ = previous => true,
            },
            None => true,
        };
        if ready {
            self.execute_all(initial, &mut pending).await;
        }

        while ready && !self.session.is_finished() && !self.sink.is_released() {
            let event = match pending.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    event = next_event(&mut self.link) => event,
                },
            };
            let transition = self.session.handle(event);
            if let Some(snapshot) = transition.snapshot {
                self.sink.publish(snapshot);
            }
            self.execute_all(transition.commands, &mut pending).await;
        }

        let teardown = self.session.shutdown();
        self.execute_all(teardown.commands, &mut pending).await;
        self.sink.release();
        self.slot.release();
        let _ = self.released.send(());
        info!(state = self.session.state().as_str(), "[FEED] session ended");
    }

    async fn execute_all(
        &mut self,
        commands: Vec<SessionCommand>,
        pending: &mut VecDeque<SessionEvent>,
    ) {
        for command in commands {
            if let Some(event) = self.execute(command).await {
                pending.push_back(event);
            }
        }
    }

    async fn execute(&mut self, command: SessionCommand) -> Option<SessionEvent> {
        match command {
            SessionCommand::Connect => {
                self.close_link(CloseCode::Normal).await;
                debug!(endpoint = %self.endpoint, "[FEED] connecting");
                self.link = Link::Connecting(Box::pin(open_connection(
                    self.endpoint.clone(),
                    self.connect_timeout,
                )));
                None
            }
            SessionCommand::Send(frame) => {
                let Link::Open(ws) = &mut self.link else {
                    return None;
                };
                let sent = send_text(ws, frame).await;
                match sent {
                    Ok(()) => None,
                    Err(e) => {
                        self.link = Link::Idle;
                        Some(SessionEvent::Error(e.to_string()))
                    }
                }
            }
            SessionCommand::ScheduleRetry(delay) => {
                self.link = Link::Waiting(Box::pin(tokio::time::sleep(delay)));
                None
            }
            SessionCommand::Close(code) => {
                self.close_link(CloseCode::from(code)).await;
                None
            }
        }
    }

    /// Drop whatever the link holds, closing an open socket with `code`.
    async fn close_link(&mut self, code: CloseCode) {
        match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Open(mut ws) => {
                let frame = CloseFrame {
                    code,
                    reason: "client shutdown".into(),
                };
                if let Err(e) = ws.close(Some(frame)).await {
                    debug!(error = %e, "[FEED] close frame not delivered");
                    return;
                }
                let drain = async { while ws.next().await.is_some() {} };
                let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
            }
            Link::Waiting(_) => debug!("[FEED] pending retry cancelled"),
            Link::Connecting(_) => debug!("[FEED] connection attempt abandoned"),
            Link::Idle => {}
        }
    }
}

async fn open_connection(endpoint: String, connect_timeout: Duration) -> Result<WsStream> {
    let (ws, _resp) = tokio::time::timeout(connect_timeout, connect_async(endpoint.as_str()))
        .await
        .map_err(|_| AppError::Timeout(format!("connecting to {endpoint}")))??;
    Ok(ws)
}

async fn send_text(ws: &mut WsStream, frame: String) -> Result<()> {
    ws.send(Message::Text(frame)).await?;
    Ok(())
}

/// Wait for the next event on the current link, leaving the link `Idle` once
/// the connection or timer it held is spent.
async fn next_event(link: &mut Link) -> SessionEvent {
    match link {
        Link::Idle => std::future::pending().await,
        Link::Connecting(connecting) => {
            let outcome = connecting.await;
            match outcome {
                Ok(ws) => {
                    *link = Link::Open(ws);
                    SessionEvent::Opened
                }
                Err(e) => {
                    *link = Link::Idle;
                    SessionEvent::Error(e.to_string())
                }
            }
        }
        Link::Waiting(timer) => {
            timer.await;
            *link = Link::Idle;
            SessionEvent::RetryElapsed
        }
        Link::Open(ws) => {
            let event = read_event(ws).await;
            if !matches!(event, SessionEvent::Message(_)) {
                *link = Link::Idle;
            }
            event
        }
    }
}

async fn read_event(ws: &mut WsStream) -> SessionEvent {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return SessionEvent::Message(text),
            Some(Ok(Message::Close(frame))) => {
                return SessionEvent::Closed {
                    code: frame.map(|f| u16::from(f.code)),
                };
            }
            // ping/pong are answered by tungstenite; binary frames carry no ticks
            Some(Ok(other)) => trace!(len = other.len(), "[FEED] non-text frame skipped"),
            Some(Err(e)) => return SessionEvent::Error(e.to_string()),
            None => return SessionEvent::Closed { code: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};

    fn counting_sink() -> (Arc<SnapshotSink>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sink = SnapshotSink::new(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (Arc::new(sink), count)
    }

    #[test]
    fn released_sink_drops_snapshots() {
        let (sink, count) = counting_sink();
        assert!(sink.publish(ClientSnapshot::default()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sink.release();
        sink.release();
        assert!(sink.is_released());
        assert!(!sink.publish(ClientSnapshot::default()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    /// Stands in for a `SessionHandle` captured by its own callback.
    struct ReleaseOnDrop {
        sink: Arc<OnceLock<Weak<SnapshotSink>>>,
        dropped: Arc<AtomicBool>,
    }

    impl ReleaseOnDrop {
        fn release(&self) {
            if let Some(sink) = self.sink.get().and_then(Weak::upgrade) {
                sink.release();
            }
        }
    }

    impl Drop for ReleaseOnDrop {
        fn drop(&mut self) {
            self.release();
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn callback_may_release_its_own_sink() {
        let owner = Arc::new(OnceLock::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let guard = ReleaseOnDrop {
            sink: owner.clone(),
            dropped: dropped.clone(),
        };
        let seen = calls.clone();
        let sink = Arc::new(SnapshotSink::new(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            guard.release();
        })));
        let _ = owner.set(Arc::downgrade(&sink));

        assert!(sink.publish(ClientSnapshot::default()));
        assert!(sink.is_released());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!sink.publish(ClientSnapshot::default()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_from_another_thread_waits_for_running_callback() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let sink = Arc::new(SnapshotSink::new(Box::new(move |_| {
            let _ = entered_tx.send(());
            let _ = resume_rx.recv();
            done.store(true, Ordering::SeqCst);
        })));

        let publisher = {
            let sink = sink.clone();
            std::thread::spawn(move || sink.publish(ClientSnapshot::default()))
        };
        entered_rx.recv().unwrap();
        let releaser = {
            let sink = sink.clone();
            std::thread::spawn(move || sink.release())
        };
        std::thread::sleep(Duration::from_millis(20));
        resume_tx.send(()).unwrap();

        releaser.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(publisher.join().unwrap());
        assert!(!sink.publish(ClientSnapshot::default()));
    }

    #[test]
    fn slot_release_only_clears_own_claim() {
        let active = Arc::new(AtomicU64::new(7));
        let stale = SessionSlot {
            active: active.clone(),
            id: 3,
        };
        stale.release();
        assert_eq!(active.load(Ordering::SeqCst), 7);

        let current = SessionSlot {
            active: active.clone(),
            id: 7,
        };
        current.release();
        assert_eq!(active.load(Ordering::SeqCst), NO_SESSION);
    }

    #[tokio::test]
    async fn retry_timer_resolves_to_retry_event() {
        let mut link = Link::Waiting(Box::pin(tokio::time::sleep(Duration::from_millis(5))));
        assert_eq!(next_event(&mut link).await, SessionEvent::RetryElapsed);
        assert!(matches!(link, Link::Idle));
    }

    #[tokio::test]
    async fn refused_connection_becomes_error_event() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut link = Link::Connecting(Box::pin(open_connection(
            format!("ws://{addr}/"),
            Duration::from_secs(2),
        )));
        assert!(matches!(next_event(&mut link).await, SessionEvent::Error(_)));
        assert!(matches!(link, Link::Idle));
    }
}
