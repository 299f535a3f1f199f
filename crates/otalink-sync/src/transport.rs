//! # Transport Session
//!
//! The one streaming socket to the device, with classified closes and a
//! single-timer reconnect scheduler.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │ Idle/Closed│ ──────────────► │ Connecting │  connect() again: no-op │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲  ▲                           │                                 │
//! │        │  │                 success   │   failure                       │
//! │        │  │                     ┌─────┴─────┐                          │
//! │        │  │                     ▼           │                           │
//! │        │  │              ┌────────────┐     │                           │
//! │        │  │              │    Open    │     │                           │
//! │        │  │              └─────┬──────┘     │                           │
//! │        │  │         close(code)│  peer/err  │                           │
//! │        │  │                    ▼     │      │                           │
//! │        │  │              ┌────────────┐     │                           │
//! │        │  └──────────────│  Closing   │     │                           │
//! │        │   closed or     └────────────┘     │                           │
//! │        │   close timeout                    │                           │
//! │        └────────────────────────────────────┘                           │
//! │                                                                         │
//! │  On an unexpected close with auto-reconnect on, exactly one reconnect  │
//! │  timer is armed with BackoffPolicy::delay(attempt, weak); attempt is   │
//! │  then incremented. Open resets attempt to 0.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Socket I/O runs in a pump task behind a [`Connector`]; the session itself
//! is plain state driven by [`TransportSession::next_event`], which the link
//! manager polls from its `select!` loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use otalink_core::lines::split_lines;
use otalink_core::{is_clean_close, BackoffPolicy, ConnectionState, LinkQuality, DEFAULT_WEAK_RSSI_DBM};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::timer::{self, Timer};

// =============================================================================
// Connection Plumbing
// =============================================================================

/// Frame the session asks the socket to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text message.
    Text(String),
    /// A close frame with an optional code.
    Close(Option<u16>),
}

/// Something the socket reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A text payload, possibly several lines.
    Text(String),
    /// The socket is gone; the close code, if the peer sent one.
    Closed(Option<u16>),
}

/// Session side of one live socket.
///
/// Dropping it aborts the pump task, if any.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::UnboundedSender<Outbound>,
    incoming: mpsc::UnboundedReceiver<SocketEvent>,
    pump: Option<JoinHandle<()>>,
}

/// Socket side of a [`Connection`]: whatever moves bytes holds this.
#[derive(Debug)]
pub struct RemoteEnd {
    /// Frames the session wants sent.
    pub outgoing: mpsc::UnboundedReceiver<Outbound>,
    /// Events for the session.
    pub incoming: mpsc::UnboundedSender<SocketEvent>,
}

impl Connection {
    /// Creates a connected pair of channel ends.
    pub fn channel() -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outgoing: out_tx,
                incoming: in_rx,
                pump: None,
            },
            RemoteEnd {
                outgoing: out_rx,
                incoming: in_tx,
            },
        )
    }

    /// Ties the lifetime of `pump` to this connection.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    fn send(&self, frame: Outbound) -> bool {
        self.outgoing.send(frame).is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl RemoteEnd {
    /// Delivers a text payload to the session.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.incoming.send(SocketEvent::Text(text.into())).is_ok()
    }

    /// Reports the socket as closed.
    pub fn close(&self, code: Option<u16>) -> bool {
        self.incoming.send(SocketEvent::Closed(code)).is_ok()
    }
}

/// Opens sockets to the device.
pub trait Connector: Send + Sync + 'static {
    /// Starts one connection attempt.
    fn connect(&self) -> BoxFuture<'static, LinkResult<Connection>>;
}

// =============================================================================
// WebSocket Connector
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] for the device's `/ws` log stream.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(url: Url, connect_timeout: Duration, ping_interval: Duration) -> Self {
        WsConnector {
            url,
            connect_timeout,
            ping_interval,
        }
    }

    pub fn from_config(config: &LinkConfig) -> LinkResult<Self> {
        Ok(WsConnector::new(
            config.ws_url()?,
            Duration::from_millis(config.transport.connect_timeout_ms),
            Duration::from_secs(config.transport.ping_interval_secs),
        ))
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, LinkResult<Connection>> {
        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        let ping_interval = self.ping_interval;

        Box::pin(async move {
            debug!(url = %url, "Opening WebSocket");
            let ws = match timeout(connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, response))) => {
                    debug!(status = ?response.status(), "WebSocket handshake complete");
                    ws
                }
                Ok(Err(e)) => return Err(LinkError::from(e)),
                Err(_) => return Err(LinkError::Timeout(connect_timeout.as_millis() as u64)),
            };

            let (connection, remote) = Connection::channel();
            let pump = tokio::spawn(pump(ws, remote, ping_interval));
            Ok(connection.with_pump(pump))
        })
    }
}

/// Bridges one WebSocket to its channel pair until either side goes away.
async fn pump(ws: WsStream, mut remote: RemoteEnd, ping_interval: Duration) {
    let (mut write, mut read) = ws.split();

    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let code = loop {
        tokio::select! {
            frame = remote.outgoing.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        warn!(error = %LinkError::from(e), "WebSocket send failed");
                        break None;
                    }
                }
                Some(Outbound::Close(code)) => {
                    let frame = code.map(|code| CloseFrame {
                        code: CloseCode::from(code),
                        reason: String::new().into(),
                    });
                    // Keep reading: the peer echoes the close frame.
                    let _ = write.send(WsMessage::Close(frame)).await;
                }
                None => {
                    let _ = write.close().await;
                    return;
                }
            },

            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if remote.incoming.send(SocketEvent::Text(text.to_string())).is_err() {
                        return;
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = write.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    break frame.map(|f| u16::from(f.code));
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("Received unexpected binary message");
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %LinkError::from(e), "WebSocket error");
                    break None;
                }
                None => break None,
            },

            _ = ping.tick() => {
                if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }
        }
    };

    let _ = remote.incoming.send(SocketEvent::Closed(code));
}

// =============================================================================
// Session
// =============================================================================

/// Tunables for [`TransportSession`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub policy: BackoffPolicy,
    pub weak_rssi_dbm: i32,
    pub close_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            policy: BackoffPolicy::default(),
            weak_rssi_dbm: DEFAULT_WEAK_RSSI_DBM,
            close_timeout: Duration::from_millis(2_000),
        }
    }
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The socket is open.
    Opened,
    /// One log line, already split and stripped.
    Line(String),
    /// The socket (or a connection attempt) ended.
    Closed {
        code: Option<u16>,
        /// Clean close: no reconnect was considered.
        expected: bool,
        /// Delay of the reconnect that was scheduled, if any.
        reconnect_in: Option<Duration>,
        /// False when a connection attempt failed before opening.
        was_open: bool,
    },
}

enum Wake {
    Dialed(LinkResult<Connection>),
    Socket(Option<SocketEvent>),
    ReconnectDue,
    CloseTimedOut,
}

/// Owner of the one streaming socket.
pub struct TransportSession {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    state: ConnectionState,
    connection: Option<Connection>,
    dialing: Option<BoxFuture<'static, LinkResult<Connection>>>,
    reconnect_timer: Timer,
    close_timer: Timer,
    attempt: u32,
    auto_reconnect: bool,
    connect_after_close: bool,
    close_code: Option<u16>,
    quality: LinkQuality,
    pending: VecDeque<SessionEvent>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings) -> Self {
        TransportSession {
            connector,
            settings,
            state: ConnectionState::Idle,
            connection: None,
            dialing: None,
            reconnect_timer: None,
            close_timer: None,
            attempt: 0,
            auto_reconnect: true,
            connect_after_close: false,
            close_code: None,
            quality: LinkQuality::default(),
            pending: VecDeque::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attempt number the next scheduled reconnect will use.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Returns true while a reconnect timer is armed.
    pub fn pending_reconnect(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn link_quality(&self) -> LinkQuality {
        self.quality
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Opens the socket unless one is open or being opened.
    pub fn connect(&mut self) {
        if self.state.is_live() {
            debug!(state = %self.state, "connect() ignored");
        } else if self.state == ConnectionState::Closing {
            debug!("connect() deferred until the socket is closed");
            self.connect_after_close = true;
        } else {
            self.dial();
        }
    }

    /// Sends a text message on the open socket.
    pub fn send(&mut self, text: impl Into<String>) -> LinkResult<()> {
        if self.state != ConnectionState::Open {
            return Err(LinkError::NotConnected);
        }
        match &self.connection {
            Some(connection) if connection.send(Outbound::Text(text.into())) => Ok(()),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Closes the socket. A clean code (1000/1001) suppresses reconnects.
    pub fn close(&mut self, code: Option<u16>) {
        self.connect_after_close = false;
        self.reconnect_timer = None;

        match self.state {
            ConnectionState::Open => {
                info!(?code, "Closing WebSocket");
                self.close_code = code;
                if let Some(connection) = &self.connection {
                    connection.send(Outbound::Close(code));
                }
                self.close_timer = timer::start(self.settings.close_timeout);
                self.set_state(ConnectionState::Closing);
            }
            ConnectionState::Connecting => {
                self.dialing = None;
                self.close_code = code;
                self.set_state(ConnectionState::Closing);
                self.finish_close(code, false);
            }
            ConnectionState::Closing | ConnectionState::Idle | ConnectionState::Closed => {}
        }
    }

    /// Enables or disables reconnects after unexpected closes.
    ///
    /// Disabling cancels a pending reconnect timer.
    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        if !enabled && self.reconnect_timer.take().is_some() {
            debug!("Pending reconnect cancelled");
        }
    }

    /// Updates the link-quality hint used for the next delay.
    pub fn set_link_quality(&mut self, quality: LinkQuality) {
        self.quality = quality;
    }

    // =========================================================================
    // Event Loop
    // =========================================================================

    /// Waits for the next session event. Cancel-safe.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            let wake = tokio::select! {
                result = dialed(&mut self.dialing) => Wake::Dialed(result),
                event = socket_event(&mut self.connection) => Wake::Socket(event),
                _ = timer::fired(&mut self.reconnect_timer) => Wake::ReconnectDue,
                _ = timer::fired(&mut self.close_timer) => Wake::CloseTimedOut,
            };

            self.handle_wake(wake);
        }
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Dialed(Ok(connection)) => {
                self.dialing = None;
                info!(after_attempts = self.attempt, "WebSocket connected");
                self.connection = Some(connection);
                self.attempt = 0;
                self.set_state(ConnectionState::Open);
                self.pending.push_back(SessionEvent::Opened);
            }
            Wake::Dialed(Err(e)) => {
                self.dialing = None;
                warn!(error = %e, "WebSocket connect failed");
                self.finish_close(None, false);
            }
            Wake::Socket(Some(SocketEvent::Text(payload))) => {
                for line in split_lines(&payload) {
                    self.pending.push_back(SessionEvent::Line(line.to_string()));
                }
            }
            Wake::Socket(Some(SocketEvent::Closed(code))) => {
                self.connection = None;
                self.finish_close(code, true);
            }
            Wake::Socket(None) => {
                self.connection = None;
                self.finish_close(None, true);
            }
            Wake::ReconnectDue => {
                self.reconnect_timer = None;
                if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
                    self.dial();
                }
            }
            Wake::CloseTimedOut => {
                warn!("Close timed out, dropping the socket");
                self.connection = None;
                self.finish_close(self.close_code, true);
            }
        }
    }

    fn dial(&mut self) {
        self.reconnect_timer = None;
        self.set_state(ConnectionState::Connecting);
        self.dialing = Some(self.connector.connect());
    }

    fn finish_close(&mut self, code: Option<u16>, was_open: bool) {
        let expected = if self.state == ConnectionState::Closing {
            is_clean_close(self.close_code)
        } else {
            is_clean_close(code)
        };
        let code = if self.state == ConnectionState::Closing {
            code.or(self.close_code)
        } else {
            code
        };
        self.close_timer = None;
        self.close_code = None;
        self.set_state(ConnectionState::Closed);

        let reconnect_in = if !expected && self.auto_reconnect && !self.connect_after_close {
            Some(self.schedule_reconnect())
        } else {
            None
        };

        info!(?code, expected, ?reconnect_in, "WebSocket closed");
        self.pending.push_back(SessionEvent::Closed {
            code,
            expected,
            reconnect_in,
            was_open,
        });

        if std::mem::take(&mut self.connect_after_close) {
            self.dial();
        }
    }

    fn schedule_reconnect(&mut self) -> Duration {
        let weak = self.quality.is_weak(self.settings.weak_rssi_dbm);
        let delay = self.settings.policy.delay(self.attempt, weak);
        debug!(attempt = self.attempt, weak, ?delay, "Reconnect scheduled");
        self.attempt = self.attempt.saturating_add(1);
        self.reconnect_timer = timer::start(delay);
        delay
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.pending.push_back(SessionEvent::StateChanged(state));
        }
    }
}

async fn dialed(slot: &mut Option<BoxFuture<'static, LinkResult<Connection>>>) -> LinkResult<Connection> {
    match slot {
        Some(dialing) => dialing.await,
        None => std::future::pending().await,
    }
}

async fn socket_event(connection: &mut Option<Connection>) -> Option<SocketEvent> {
    match connection {
        Some(connection) => connection.incoming.recv().await,
        None => std::future::pending().await,
    }
}
