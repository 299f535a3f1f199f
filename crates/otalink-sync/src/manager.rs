//! # Link Manager
//!
//! Composition root of the device link. One task owns every piece of link
//! state and is the only place that mutates it.
//!
//! ## Manager Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        LinkManager Architecture                         │
//! │                                                                         │
//! │   LinkHandle (cloneable) ──Command──┐                                   │
//! │                                     ▼                                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 LinkManager task (select! loop)                  │  │
//! │  │                                                                  │  │
//! │  │   commands      session.next_event()   monitor.next_event()      │  │
//! │  │                 watcher.next_event()                             │  │
//! │  └───────┬──────────────────┬─────────────────────┬─────────────────┘  │
//! │          ▼                  ▼                     ▼                     │
//! │  ┌────────────────┐ ┌────────────────┐  ┌────────────────────────┐     │
//! │  │TransportSession│ │ UploadMonitor  │  │ RebootWatcher          │     │
//! │  │ socket + retry │ │ outcome latch  │  │ quiet/retry/fallback   │     │
//! │  └────────────────┘ └────────────────┘  └────────────────────────┘     │
//! │                                                                         │
//! │  WIRING:                                                               │
//! │  ───────                                                               │
//! │  upload success ─► watcher.arm + auto-reconnect off + close(1000)      │
//! │  watcher due    ─► session.connect()                                   │
//! │  session opened ─► watcher.on_connected                                │
//! │  session line   ─► watcher.on_line                                     │
//! │  ready          ─► device_ready (once) + auto-reconnect on             │
//! │                                                                         │
//! │  EVENTS: one ordered LinkEvent stream; closed on shutdown.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use otalink_core::{
    validate_payload, ConnectionState, LinkEvent, LinkQuality, ReadyCause, RebootPhase,
    UploadAttemptId, UploadTarget, CLOSE_NORMAL,
};

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::reboot::{RebootTimings, RebootWatcher, WatcherEvent};
use crate::transport::{Connector, SessionEvent, SessionSettings, TransportSession};
use crate::upload::{MonitorEvent, MonitorSettings, UploadMonitor, Uploader};

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 64;

// =============================================================================
// Settings & Status
// =============================================================================

/// Everything the manager needs besides its I/O seams.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub session: SessionSettings,
    pub monitor: MonitorSettings,
    pub reboot: RebootTimings,
}

impl ManagerSettings {
    pub fn from_config(config: &LinkConfig) -> LinkResult<Self> {
        Ok(ManagerSettings {
            session: config.session_settings()?,
            monitor: config.monitor_settings(),
            reboot: config.reboot_timings(),
        })
    }
}

/// Snapshot of the link for external queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// Current socket state.
    pub connection: ConnectionState,

    /// Attempt number the next reconnect will use.
    pub reconnect_attempt: u32,

    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,

    /// Whether unexpected closes trigger reconnects.
    pub auto_reconnect: bool,

    /// Phase of the post-update reboot wait.
    pub reboot_phase: RebootPhase,

    /// Whether an upload attempt has not resolved yet.
    pub upload_in_flight: bool,

    /// Last RSSI reported by the device, in dBm.
    pub rssi_dbm: Option<i32>,
}

impl LinkStatus {
    /// Returns true while the device is rebooting after an update.
    pub fn is_rebooting(&self) -> bool {
        matches!(
            self.reboot_phase,
            RebootPhase::AwaitingReconnect | RebootPhase::AwaitingReadyMarker
        )
    }
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Upload {
        target: UploadTarget,
        file_name: String,
        bytes: Vec<u8>,
        reply: oneshot::Sender<LinkResult<UploadAttemptId>>,
    },
    Send {
        text: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    ReportRssi(i32),
    Status(oneshot::Sender<LinkStatus>),
    Shutdown,
}

/// Cloneable handle to a running [`LinkManager`].
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<Command>,
}

impl LinkHandle {
    /// Starts an upload. Empty payloads are rejected before reaching the
    /// manager.
    pub async fn upload(
        &self,
        target: UploadTarget,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> LinkResult<UploadAttemptId> {
        validate_payload(&bytes)?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Upload {
            target,
            file_name: file_name.into(),
            bytes,
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::ShuttingDown)?
    }

    /// Sends a text message to the device.
    pub async fn send(&self, text: impl Into<String>) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::ShuttingDown)?
    }

    /// Feeds an RSSI reading into the reconnect policy.
    pub async fn report_rssi(&self, rssi_dbm: i32) -> LinkResult<()> {
        self.command(Command::ReportRssi(rssi_dbm)).await
    }

    /// Returns a status snapshot.
    pub async fn status(&self) -> LinkResult<LinkStatus> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Status(reply)).await?;
        rx.await.map_err(|_| LinkError::ShuttingDown)
    }

    /// Stops the manager. The event stream ends afterwards.
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.command(Command::Shutdown).await
    }

    async fn command(&self, command: Command) -> LinkResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::ShuttingDown)
    }
}

// =============================================================================
// Manager
// =============================================================================

enum Wake {
    Command(Command),
    Session(SessionEvent),
    Upload(MonitorEvent),
    Reboot(WatcherEvent),
}

/// Owner of the session, the upload monitor and the reboot watcher.
pub struct LinkManager {
    session: TransportSession,
    monitor: UploadMonitor,
    watcher: RebootWatcher,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkManager {
    /// Creates a manager with its handle and event stream.
    pub fn new(
        connector: Arc<dyn Connector>,
        uploader: Arc<dyn Uploader>,
        settings: ManagerSettings,
    ) -> (Self, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let manager = LinkManager {
            session: TransportSession::new(connector, settings.session),
            monitor: UploadMonitor::new(uploader, settings.monitor),
            watcher: RebootWatcher::new(settings.reboot),
            commands: command_rx,
            events: event_tx,
        };

        (
            manager,
            LinkHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Creates a manager and spawns it on the current runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        uploader: Arc<dyn Uploader>,
        settings: ManagerSettings,
    ) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>, JoinHandle<()>) {
        let (manager, handle, events) = LinkManager::new(connector, uploader, settings);
        let task = tokio::spawn(manager.run());
        (handle, events, task)
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Link manager starting");
        self.session.connect();

        loop {
            let wake = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => {
                        debug!("All link handles dropped");
                        break;
                    }
                },
                event = self.session.next_event() => Wake::Session(event),
                event = self.monitor.next_event() => Wake::Upload(event),
                event = self.watcher.next_event() => Wake::Reboot(event),
            };

            match wake {
                Wake::Command(Command::Shutdown) => {
                    info!("Link manager shutting down");
                    break;
                }
                Wake::Command(command) => self.handle_command(command),
                Wake::Session(event) => self.handle_session(event),
                Wake::Upload(event) => self.handle_upload(event),
                Wake::Reboot(event) => self.handle_reboot(event),
            }
        }

        info!("Link manager stopped");
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Upload {
                target,
                file_name,
                bytes,
                reply,
            } => {
                let result = if self.watcher.is_active() {
                    Err(LinkError::RebootInProgress)
                } else {
                    self.monitor.start(target, file_name, bytes)
                };
                let _ = reply.send(result);
            }
            Command::Send { text, reply } => {
                let _ = reply.send(self.session.send(text));
            }
            Command::ReportRssi(rssi_dbm) => {
                debug!(rssi_dbm, "RSSI reported");
                self.session.set_link_quality(LinkQuality::from_rssi(rssi_dbm));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                debug!(%state, "Connection state changed");
            }
            SessionEvent::Opened => {
                self.watcher.on_connected();
                self.emit(LinkEvent::Connected);
            }
            SessionEvent::Line(line) => {
                let ready = self.watcher.on_line(&line);
                self.emit(LinkEvent::LogLine {
                    line,
                    received_at: Utc::now(),
                });
                if let Some(cause) = ready {
                    self.device_ready(cause);
                }
            }
            SessionEvent::Closed {
                reconnect_in,
                was_open,
                ..
            } => {
                self.watcher.on_disconnected();
                if was_open || reconnect_in.is_some() {
                    self.emit(LinkEvent::disconnected(reconnect_in));
                }
            }
        }
    }

    fn handle_upload(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Progress {
                attempt,
                target,
                percent,
            } => self.emit(LinkEvent::UploadProgress {
                attempt,
                target,
                percent,
            }),
            MonitorEvent::Resolved {
                attempt,
                target,
                outcome,
            } => {
                let success = outcome.is_success();
                self.emit(LinkEvent::UploadResolved {
                    attempt,
                    target,
                    outcome,
                });
                if success {
                    self.begin_reboot();
                }
            }
        }
    }

    fn handle_reboot(&mut self, event: WatcherEvent) {
        match event {
            WatcherEvent::ReconnectDue => self.session.connect(),
            WatcherEvent::Ready(cause) => self.device_ready(cause),
        }
    }

    fn begin_reboot(&mut self) {
        if !self.watcher.arm() {
            return;
        }
        self.session.set_auto_reconnect(false);
        self.session.close(Some(CLOSE_NORMAL));
    }

    fn device_ready(&mut self, cause: ReadyCause) {
        self.emit(LinkEvent::DeviceReady { cause });
        self.session.set_auto_reconnect(true);
        self.session.connect();
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            connection: self.session.state(),
            reconnect_attempt: self.session.attempt(),
            reconnect_pending: self.session.pending_reconnect(),
            auto_reconnect: self.session.auto_reconnect(),
            reboot_phase: self.watcher.phase(),
            upload_in_flight: self.monitor.is_active(),
            rssi_dbm: self.session.link_quality().rssi_dbm,
        }
    }

    fn emit(&self, event: LinkEvent) {
        debug!(event = event.type_name(), "Link event");
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Dial, FakeConnector, FakeUploader, StartedUpload};
    use crate::transport::{Outbound, RemoteEnd};
    use otalink_core::{FailureReason, UploadOutcome, UploadSignal};

    struct Harness {
        handle: LinkHandle,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        remotes: mpsc::UnboundedReceiver<RemoteEnd>,
        uploads: mpsc::UnboundedReceiver<StartedUpload>,
        task: JoinHandle<()>,
    }

    fn harness(dial: Dial) -> Harness {
        let (connector, remotes) = FakeConnector::new(dial);
        let (uploader, uploads) = FakeUploader::new();
        let (handle, events, task) = LinkManager::spawn(
            Arc::new(connector),
            Arc::new(uploader),
            ManagerSettings::default(),
        );
        Harness {
            handle,
            events,
            remotes,
            uploads,
            task,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        events.recv().await.expect("event stream ended")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_start() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.connection, ConnectionState::Open);
        assert_eq!(status.reboot_phase, RebootPhase::Inactive);
        assert!(status.auto_reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reaches_device() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);
        let mut remote = h.remotes.recv().await.unwrap();

        h.handle.send("restart").await.unwrap();
        assert_eq!(remote.outgoing.recv().await, Some(Outbound::Text("restart".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_fails_fast() {
        let h = harness(Dial::Hang);
        let err = h
            .handle
            .upload(UploadTarget::Firmware, "fw.bin", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidPayload));
        assert!(!h.handle.status().await.unwrap().upload_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_upload_rejected_while_pending() {
        let h = harness(Dial::Accept);
        h.handle
            .upload(UploadTarget::Firmware, "fw.bin", vec![0; 64])
            .await
            .unwrap();
        let err = h
            .handle
            .upload(UploadTarget::Filesystem, "fs.bin", vec![0; 64])
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::UploadInProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_starts_reboot_wait() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);
        let mut remote = h.remotes.recv().await.unwrap();

        let attempt = h
            .handle
            .upload(UploadTarget::Firmware, "fw.bin", vec![0; 64])
            .await
            .unwrap();
        let upload = h.uploads.recv().await.unwrap();
        upload.signals.send(UploadSignal::Response { status: 200 }).unwrap();

        assert_eq!(
            next_event(&mut h.events).await,
            LinkEvent::UploadResolved {
                attempt,
                target: UploadTarget::Firmware,
                outcome: UploadOutcome::Succeeded,
            }
        );
        assert_eq!(remote.outgoing.recv().await, Some(Outbound::Close(Some(1000))));

        let status = h.handle.status().await.unwrap();
        assert!(status.is_rebooting());
        assert!(!status.auto_reconnect);

        let err = h
            .handle
            .upload(UploadTarget::Firmware, "fw.bin", vec![0; 64])
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::RebootInProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_keeps_normal_link() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);

        h.handle
            .upload(UploadTarget::Filesystem, "fs.bin", vec![0; 64])
            .await
            .unwrap();
        let upload = h.uploads.recv().await.unwrap();
        upload.signals.send(UploadSignal::Response { status: 500 }).unwrap();

        match next_event(&mut h.events).await {
            LinkEvent::UploadResolved { outcome, .. } => assert_eq!(
                outcome,
                UploadOutcome::Failed {
                    reason: FailureReason::HttpStatus { status: 500 }
                }
            ),
            other => panic!("unexpected event {other:?}"),
        }

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.reboot_phase, RebootPhase::Inactive);
        assert_eq!(status.connection, ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_rssi_stretches_reconnect() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);
        let remote = h.remotes.recv().await.unwrap();

        h.handle.report_rssi(-82).await.unwrap();
        assert_eq!(h.handle.status().await.unwrap().rssi_dbm, Some(-82));

        remote.close(Some(1006));
        assert_eq!(
            next_event(&mut h.events).await,
            LinkEvent::Disconnected {
                reconnect_in_ms: Some(3_000)
            }
        );
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_event_stream() {
        let mut h = harness(Dial::Accept);
        assert_eq!(next_event(&mut h.events).await, LinkEvent::Connected);

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();
        assert!(h.events.recv().await.is_none());
        assert!(matches!(
            h.handle.status().await,
            Err(LinkError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_manager() {
        let h = harness(Dial::Hang);
        drop(h.handle);
        h.task.await.unwrap();
    }
}
