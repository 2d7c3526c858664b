use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use serde_json::{Map, Value};
use shared::{
    domain::ChatId,
    protocol::{EventKind, InboundEvent, OutboundFrame},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::TokenProvider,
    config::ClientSettings,
    dispatcher::EventDispatcher,
    error::TransportError,
    outbound_queue::OutboundQueue,
    socket::{SocketChannel, SocketConnector, SocketEvent},
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

struct ActiveSocket {
    outgoing: mpsc::UnboundedSender<String>,
    // Dropping this stops the reader task.
    shutdown: oneshot::Sender<()>,
    pump: Option<JoinHandle<()>>,
}

impl ActiveSocket {
    fn transmit(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let text = frame
            .encode()
            .map_err(|err| TransportError::SendFailure(err.to_string()))?;
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::SendFailure("socket writer is closed".into()))
    }

    async fn close(self) {
        let ActiveSocket {
            outgoing,
            shutdown,
            pump,
        } = self;
        drop(outgoing);
        drop(shutdown);
        if let Some(pump) = pump {
            if tokio::time::timeout(CLOSE_GRACE, pump).await.is_err() {
                debug!("ws: socket pump did not finish within close grace period");
            }
        }
    }
}

// Settles a connect whose future is dropped before the socket opens.
struct PendingAttempt<'a> {
    connection: &'a ChatConnection,
    generation: u64,
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        self.connection.abandon_attempt(self.generation);
    }
}

#[derive(Default)]
struct ReconnectState {
    attempt_count: u32,
    timer: Option<JoinHandle<()>>,
}

impl ReconnectState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct ConnectionInner {
    state: ConnectionState,
    room: Option<ChatId>,
    // Bumped by every connect/disconnect; callbacks from older sockets are ignored.
    generation: u64,
    socket: Option<ActiveSocket>,
    queue: OutboundQueue,
    reconnect: ReconnectState,
}

pub struct ChatConnection {
    settings: ClientSettings,
    tokens: Arc<dyn TokenProvider>,
    connector: Arc<dyn SocketConnector>,
    dispatcher: EventDispatcher,
    inner: Mutex<ConnectionInner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ChatConnection {
    pub fn new(
        settings: ClientSettings,
        tokens: Arc<dyn TokenProvider>,
        connector: Arc<dyn SocketConnector>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            settings,
            tokens,
            connector,
            dispatcher: EventDispatcher::new(),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                room: None,
                generation: 0,
                socket: None,
                queue: OutboundQueue::new(),
                reconnect: ReconnectState::default(),
            }),
            state_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut ConnectionInner, state: ConnectionState) {
        if inner.state != state {
            debug!(from = ?inner.state, to = ?state, "ws: state transition");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn connected(&self) -> bool {
        let inner = self.lock();
        inner.state == ConnectionState::Open && inner.socket.is_some()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn room(&self) -> Option<ChatId> {
        self.lock().room.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect.attempt_count
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.lock()
            .reconnect
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn queued_frames(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(InboundEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, handler);
    }

    pub fn off(&self, kind: EventKind) {
        self.dispatcher.off(kind);
    }

    pub async fn connect(self: &Arc<Self>, room: Option<ChatId>) -> Result<(), TransportError> {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connecting {
                inner.reconnect.cancel_timer();
                inner.reconnect.attempt_count = 0;
            }
        }
        self.connect_attempt(room).await
    }

    async fn connect_attempt(self: &Arc<Self>, room: Option<ChatId>) -> Result<(), TransportError> {
        let (generation, previous) = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Connecting {
                debug!("ws: connection already in progress");
                return Ok(());
            }
            if inner.state == ConnectionState::Open && inner.room == room {
                debug!("ws: already connected to this chat");
                return Ok(());
            }
            inner.generation += 1;
            inner.room = room.clone();
            let previous = inner.socket.take();
            self.set_state(&mut inner, ConnectionState::Connecting);
            (inner.generation, previous)
        };

        let attempt = PendingAttempt {
            connection: self,
            generation,
        };

        if let Some(previous) = previous {
            previous.close().await;
        }

        let opened = self.open_socket(room.as_ref()).await;
        std::mem::forget(attempt);
        match opened {
            Ok(channel) => self.on_open(generation, channel),
            Err(err) => {
                self.on_connect_failed(generation, &err);
                Err(err)
            }
        }
    }

    fn abandon_attempt(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            return;
        }
        inner.generation += 1;
        self.set_state(&mut inner, ConnectionState::Closed);
        info!("ws: connection attempt cancelled");
    }

    async fn open_socket(&self, room: Option<&ChatId>) -> Result<SocketChannel, TransportError> {
        let token = self
            .tokens
            .bearer_token()
            .await
            .ok_or(TransportError::AuthMissing)?;
        let url = self.settings.socket_url(room, &token)?;
        info!(
            host = url.host_str().unwrap_or_default(),
            path = url.path(),
            "ws: connecting"
        );

        let timeout = self.settings.connect_timeout;
        match tokio::time::timeout(timeout, self.connector.open(&url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn on_open(self: &Arc<Self>, generation: u64, channel: SocketChannel) -> Result<(), TransportError> {
        let SocketChannel {
            outgoing,
            incoming,
            pump,
        } = channel;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let socket = ActiveSocket {
            outgoing,
            shutdown: shutdown_tx,
            pump,
        };

        let (room, flushed) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                info!("ws: connection attempt superseded before open");
                return Err(TransportError::Connection(
                    "connection attempt was superseded".into(),
                ));
            }
            inner.reconnect.cancel_timer();
            inner.reconnect.attempt_count = 0;
            inner.socket = Some(socket);
            self.set_state(&mut inner, ConnectionState::Open);

            let ConnectionInner { socket, queue, .. } = &mut *inner;
            let flushed = match socket.as_ref() {
                Some(socket) => queue.flush(|frame| socket.transmit(frame)),
                None => Ok(0),
            };
            (inner.room.clone(), flushed)
        };

        match flushed {
            Ok(count) => info!(room = ?room, flushed = count, "ws: connected"),
            Err(error) => warn!(room = ?room, %error, "ws: connected but queue flush stopped"),
        }

        tokio::spawn(read_frames(
            Arc::downgrade(self),
            generation,
            incoming,
            shutdown_rx,
        ));
        Ok(())
    }

    fn on_connect_failed(self: &Arc<Self>, generation: u64, err: &TransportError) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.socket = None;
        self.set_state(&mut inner, ConnectionState::Closed);
        warn!(error = %err, "ws: connection attempt failed");
        if err.is_retryable() {
            self.schedule_reconnect(&mut inner);
        }
    }

    fn handle_socket_closed(self: &Arc<Self>, generation: u64, code: Option<u16>) {
        let mut inner = self.lock();
        // A newer connect is in flight, or the close was requested locally.
        if inner.generation != generation || inner.state != ConnectionState::Open {
            return;
        }
        inner.socket = None;
        self.set_state(&mut inner, ConnectionState::Closed);
        info!(code = ?code, "ws: disconnected");
        self.schedule_reconnect(&mut inner);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        let policy = self.settings.reconnect;
        if !policy.allows_attempt(inner.reconnect.attempt_count) {
            warn!(
                max_attempts = policy.max_attempts,
                "ws: maximum reconnect attempts reached"
            );
            return;
        }

        inner.reconnect.cancel_timer();
        inner.reconnect.attempt_count += 1;
        let attempt = inner.reconnect.attempt_count;
        let delay = policy.next_delay(attempt);
        info!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "ws: scheduling reconnect"
        );

        let weak = Arc::downgrade(self);
        let room = inner.room.clone();
        inner.reconnect.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = connection.lock();
                // Release our own handle; the attempt below may schedule the next timer.
                inner.reconnect.timer = None;
                if inner.state == ConnectionState::Connecting {
                    return;
                }
            }
            info!(room = ?room, attempt, "ws: reconnecting");
            if let Err(error) = connection.connect_attempt(room).await {
                debug!(%error, attempt, "ws: reconnect attempt failed");
            }
        }));
    }

    /// Cancels any pending reconnect, closes the socket and settles in Closed.
    pub async fn disconnect(&self) {
        let (generation, socket) = {
            let mut inner = self.lock();
            inner.reconnect.cancel_timer();
            inner.reconnect.attempt_count = 0;
            inner.generation += 1;
            let socket = inner.socket.take();
            if socket.is_some() {
                self.set_state(&mut inner, ConnectionState::Closing);
            }
            (inner.generation, socket)
        };

        if let Some(socket) = socket {
            socket.close().await;
            info!("ws: disconnected by client");
        }

        let mut inner = self.lock();
        if inner.generation == generation {
            self.set_state(&mut inner, ConnectionState::Closed);
        }
    }

    pub fn send_frame(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Open {
            if let Some(socket) = inner.socket.as_ref() {
                debug!(kind = %frame.kind, "ws: sending frame");
                return socket.transmit(&frame);
            }
        }
        warn!(
            kind = %frame.kind,
            queued = inner.queue.len() + 1,
            "ws: not connected, queueing frame"
        );
        inner.queue.enqueue(frame);
        Ok(())
    }

    pub fn send(&self, kind: &str, payload: Option<Map<String, Value>>) -> Result<(), TransportError> {
        self.send_frame(OutboundFrame::new(kind, payload))
    }

    pub fn send_chat_message(&self, content: &str) -> Result<(), TransportError> {
        self.send_frame(OutboundFrame::chat_message(content))
    }

    pub fn send_typing(&self) -> Result<(), TransportError> {
        self.send_frame(OutboundFrame::typing())
    }

    pub fn mark_as_read(&self) -> Result<(), TransportError> {
        self.send_frame(OutboundFrame::read_messages())
    }

    pub fn mark_as_delivered(&self) -> Result<(), TransportError> {
        self.send_frame(OutboundFrame::delivered_messages())
    }
}

async fn read_frames(
    connection: Weak<ChatConnection>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<SocketEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            event = incoming.recv() => event,
            _ = &mut shutdown => return,
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match event {
            Some(SocketEvent::Text(text)) => {
                if !connection.is_current(generation) {
                    return;
                }
                connection.dispatcher.dispatch(&text);
            }
            Some(SocketEvent::Closed { code }) => {
                connection.handle_socket_closed(generation, code);
                return;
            }
            Some(SocketEvent::Error(error)) => {
                warn!(%error, "ws: socket error");
                connection.handle_socket_closed(generation, None);
                return;
            }
            None => {
                connection.handle_socket_closed(generation, None);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
