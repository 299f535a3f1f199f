//! End-to-end link scenarios on virtual time: upload, reboot, ready.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use otalink_core::{
    AssumedSuccess, FailureReason, LinkEvent, ReadyCause, RebootPhase, ResolverSettings,
    UploadOutcome, UploadSignal, UploadTarget,
};
use otalink_sync::{
    Connection, Connector, LinkError, LinkHandle, LinkManager, LinkResult, ManagerSettings,
    MonitorSettings, Outbound, RebootTimings, RemoteEnd, UploadRequest, Uploader,
};

const MARKER: &str = "=== Setup complete ===";

// =============================================================================
// Fakes
// =============================================================================

#[derive(Clone, Copy)]
enum Dial {
    Accept,
    Refuse,
}

#[derive(Clone)]
struct ScriptedConnector {
    script: Arc<Mutex<VecDeque<Dial>>>,
    fallback: Arc<Mutex<Dial>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl ScriptedConnector {
    fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ScriptedConnector {
                script: Arc::new(Mutex::new(VecDeque::new())),
                fallback: Arc::new(Mutex::new(Dial::Accept)),
                remotes: tx,
            },
            rx,
        )
    }

    /// Next dials follow `dials`, then every dial does `then`.
    fn script(&self, dials: &[Dial], then: Dial) {
        self.script.lock().unwrap().extend(dials.iter().copied());
        *self.fallback.lock().unwrap() = then;
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> BoxFuture<'static, LinkResult<Connection>> {
        let dial = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());
        match dial {
            Dial::Accept => {
                let (connection, remote) = Connection::channel();
                self.remotes.send(remote).unwrap();
                Box::pin(async move { Ok(connection) })
            }
            Dial::Refuse => Box::pin(async {
                Err(LinkError::ConnectionFailed("connection refused".into()))
            }),
        }
    }
}

struct ManualUploader {
    started: mpsc::UnboundedSender<mpsc::UnboundedSender<UploadSignal>>,
}

impl Uploader for ManualUploader {
    fn start(
        &self,
        _request: UploadRequest,
        signals: mpsc::UnboundedSender<UploadSignal>,
    ) -> JoinHandle<()> {
        self.started.send(signals).unwrap();
        tokio::spawn(async {})
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Link {
    handle: LinkHandle,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    connector: ScriptedConnector,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    uploads: mpsc::UnboundedReceiver<mpsc::UnboundedSender<UploadSignal>>,
}

impl Link {
    async fn start(settings: ManagerSettings) -> Link {
        let (connector, remotes) = ScriptedConnector::new();
        let (started, uploads) = mpsc::unbounded_channel();
        let (handle, events, _task) = LinkManager::spawn(
            Arc::new(connector.clone()),
            Arc::new(ManualUploader { started }),
            settings,
        );

        let mut link = Link {
            handle,
            events,
            connector,
            remotes,
            uploads,
        };
        assert_eq!(link.next().await, LinkEvent::Connected);
        link
    }

    async fn next(&mut self) -> LinkEvent {
        self.events.recv().await.expect("event stream ended")
    }

    /// Skips events until one matches.
    async fn until(&mut self, wanted: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        loop {
            let event = self.next().await;
            if wanted(&event) {
                return event;
            }
        }
    }

    /// Collects every event delivered within `window`.
    async fn drain_for(&mut self, window: Duration) -> Vec<LinkEvent> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            seen.push(event);
        }
        seen
    }

    async fn upload(&mut self) -> mpsc::UnboundedSender<UploadSignal> {
        self.handle
            .upload(UploadTarget::Firmware, "firmware.bin", vec![0xA5; 1000])
            .await
            .unwrap();
        self.uploads.recv().await.unwrap()
    }

    /// Uploads, confirms with HTTP 200 and acknowledges the clean close.
    async fn successful_update(&mut self) -> Instant {
        let mut remote = self.remotes.recv().await.unwrap();
        let signals = self.upload().await;
        signals.send(UploadSignal::Response { status: 200 }).unwrap();

        let resolved = self
            .until(|e| matches!(e, LinkEvent::UploadResolved { .. }))
            .await;
        let armed_at = Instant::now();
        assert!(matches!(
            resolved,
            LinkEvent::UploadResolved { outcome: UploadOutcome::Succeeded, .. }
        ));

        assert_eq!(remote.outgoing.recv().await, Some(Outbound::Close(Some(1000))));
        remote.close(Some(1000));
        assert_eq!(
            self.next().await,
            LinkEvent::Disconnected { reconnect_in_ms: None }
        );
        armed_at
    }
}

fn is_ready(event: &LinkEvent) -> bool {
    matches!(event, LinkEvent::DeviceReady { .. })
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_marker_after_reconnect_wins_over_fallback() {
    let mut link = Link::start(ManagerSettings::default()).await;
    link.connector.script(&[Dial::Refuse, Dial::Accept], Dial::Accept);
    let armed_at = link.successful_update().await;

    // First retry at 10s is refused, the one at 12s gets through.
    assert_eq!(link.next().await, LinkEvent::Connected);
    assert_eq!(armed_at.elapsed(), Duration::from_secs(12));
    let remote = link.remotes.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    remote.send_text(format!("LittleFS mounted\n{MARKER}\n"));

    let ready = link.until(is_ready).await;
    assert_eq!(ready, LinkEvent::DeviceReady { cause: ReadyCause::Marker });
    assert_eq!(armed_at.elapsed(), Duration::from_secs(13));

    let later = link.drain_for(Duration::from_secs(30)).await;
    assert!(!later.iter().any(is_ready));

    let status = link.handle.status().await.unwrap();
    assert_eq!(status.reboot_phase, RebootPhase::Done);
    assert!(status.auto_reconnect);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_when_marker_never_arrives() {
    let mut link = Link::start(ManagerSettings::default()).await;
    let armed_at = link.successful_update().await;

    assert_eq!(link.next().await, LinkEvent::Connected);
    assert_eq!(armed_at.elapsed(), Duration::from_secs(10));
    let remote = link.remotes.recv().await.unwrap();
    remote.send_text("WiFi connected: Demo-Network");

    let ready = link.until(is_ready).await;
    assert_eq!(ready, LinkEvent::DeviceReady { cause: ReadyCause::Fallback });
    assert_eq!(armed_at.elapsed(), Duration::from_secs(18));

    // A late marker is just another log line.
    remote.send_text(MARKER);
    let later = link.drain_for(Duration::from_secs(30)).await;
    assert!(later.iter().any(|e| matches!(e, LinkEvent::LogLine { line, .. } if line == MARKER)));
    assert!(!later.iter().any(is_ready));
}

#[tokio::test(start_paused = true)]
async fn test_device_never_returns() {
    let mut link = Link::start(ManagerSettings {
        reboot: RebootTimings {
            reconnect_deadline: Duration::from_millis(8_000),
            ..RebootTimings::default()
        },
        ..ManagerSettings::default()
    })
    .await;
    link.connector.script(&[], Dial::Refuse);
    let armed_at = link.successful_update().await;

    let ready = link.until(is_ready).await;
    assert_eq!(
        ready,
        LinkEvent::DeviceReady { cause: ReadyCause::ReconnectDeadline }
    );
    assert_eq!(armed_at.elapsed(), Duration::from_secs(8));

    // Normal reconnects resume; ready is never repeated.
    let later = link.drain_for(Duration::from_secs(60)).await;
    assert!(!later.iter().any(is_ready));
    assert!(later.contains(&LinkEvent::Disconnected {
        reconnect_in_ms: Some(2_000)
    }));
}

#[tokio::test(start_paused = true)]
async fn test_drop_while_waiting_for_marker() {
    let mut link = Link::start(ManagerSettings::default()).await;
    let armed_at = link.successful_update().await;

    assert_eq!(link.next().await, LinkEvent::Connected);
    let remote = link.remotes.recv().await.unwrap();
    remote.close(None);
    assert_eq!(
        link.next().await,
        LinkEvent::Disconnected { reconnect_in_ms: None }
    );

    assert_eq!(link.next().await, LinkEvent::Connected);
    assert_eq!(armed_at.elapsed(), Duration::from_secs(12));
    let remote = link.remotes.recv().await.unwrap();
    remote.send_text(MARKER);

    let ready = link.until(is_ready).await;
    assert_eq!(ready, LinkEvent::DeviceReady { cause: ReadyCause::Marker });
}

#[tokio::test(start_paused = true)]
async fn test_error_after_full_progress_is_success() {
    let mut link = Link::start(ManagerSettings {
        monitor: MonitorSettings {
            resolver: ResolverSettings {
                near_complete_percent: 99,
            },
            ..MonitorSettings::default()
        },
        ..ManagerSettings::default()
    })
    .await;
    let signals = link.upload().await;

    for sent in [250, 500, 750, 1000] {
        signals
            .send(UploadSignal::Progress { sent, total: 1000 })
            .unwrap();
    }
    signals
        .send(UploadSignal::NetworkError("connection reset by peer".into()))
        .unwrap();

    let mut percents = Vec::new();
    let outcome = loop {
        match link.next().await {
            LinkEvent::UploadProgress { percent, .. } => percents.push(percent),
            LinkEvent::UploadResolved { outcome, .. } => break outcome,
            _ => {}
        }
    };
    assert_eq!(percents, vec![25, 50, 75, 100]);
    assert_eq!(
        outcome,
        UploadOutcome::AssumedSucceeded {
            evidence: AssumedSuccess::ErrorNearComplete { percent: 100 }
        }
    );
    assert!(link.handle.status().await.unwrap().is_rebooting());
}

#[tokio::test(start_paused = true)]
async fn test_error_at_forty_percent_fails_without_reboot() {
    let mut link = Link::start(ManagerSettings::default()).await;
    let signals = link.upload().await;

    signals
        .send(UploadSignal::Progress { sent: 400, total: 1000 })
        .unwrap();
    signals
        .send(UploadSignal::NetworkError("connection reset by peer".into()))
        .unwrap();

    let resolved = link
        .until(|e| matches!(e, LinkEvent::UploadResolved { .. }))
        .await;
    assert!(matches!(
        resolved,
        LinkEvent::UploadResolved {
            outcome: UploadOutcome::Failed {
                reason: FailureReason::Transport { .. }
            },
            ..
        }
    ));

    let status = link.handle.status().await.unwrap();
    assert_eq!(status.reboot_phase, RebootPhase::Inactive);
    assert!(!status.upload_in_flight);

    let later = link.drain_for(Duration::from_secs(30)).await;
    assert!(!later.iter().any(is_ready));
}

#[tokio::test(start_paused = true)]
async fn test_grace_resolves_silent_upload() {
    let mut link = Link::start(ManagerSettings::default()).await;
    let signals = link.upload().await;

    signals
        .send(UploadSignal::Progress { sent: 1000, total: 1000 })
        .unwrap();
    let completed_at = Instant::now();

    let resolved = link
        .until(|e| matches!(e, LinkEvent::UploadResolved { .. }))
        .await;
    assert_eq!(completed_at.elapsed(), Duration::from_millis(500));
    assert!(matches!(
        resolved,
        LinkEvent::UploadResolved {
            outcome: UploadOutcome::AssumedSucceeded {
                evidence: AssumedSuccess::GraceElapsed
            },
            ..
        }
    ));

    // The device answers late; nothing changes.
    let _ = signals.send(UploadSignal::Response { status: 500 });
    let later = link.drain_for(Duration::from_secs(1)).await;
    assert!(!later
        .iter()
        .any(|e| matches!(e, LinkEvent::UploadResolved { .. })));
}
