//! # Upload Monitor
//!
//! Drives one image upload and reduces its transport signals to exactly one
//! [`UploadOutcome`].
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   start(bytes)                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  UploadSignal   ┌──────────────────┐                 │
//! │  │  Uploader    │ ──────────────► │  OutcomeResolver │──► Resolved     │
//! │  │  (HTTP task) │  progress,      │  (ranked rules)  │    (once)       │
//! │  └──────────────┘  response,      └────────┬─────────┘                 │
//! │                    ended, error            │ StartGrace                 │
//! │                                            ▼                            │
//! │                                    grace timer (500 ms)                 │
//! │                                                                         │
//! │  After Resolved the request task is left running; its signals are      │
//! │  dropped. It is aborted when the next attempt starts.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use otalink_core::outcome::DEFAULT_GRACE_MS;
use otalink_core::{
    validate_payload, OutcomeResolver, Resolution, ResolverSettings, UploadAttemptId,
    UploadOutcome, UploadSignal, UploadTarget,
};

use crate::config::{Credentials, LinkConfig};
use crate::error::{LinkError, LinkResult};
use crate::timer::{self, Timer};

/// Size of the body chunks handed to the HTTP client.
const CHUNK_SIZE: usize = 16 * 1024;

// =============================================================================
// Uploader Seam
// =============================================================================

/// One image to upload.
#[derive(Clone)]
pub struct UploadRequest {
    pub target: UploadTarget,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("target", &self.target)
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Runs upload requests and reports what happens to them.
pub trait Uploader: Send + Sync + 'static {
    /// Spawns the request. Every signal goes to `signals`.
    fn start(
        &self,
        request: UploadRequest,
        signals: mpsc::UnboundedSender<UploadSignal>,
    ) -> JoinHandle<()>;
}

// =============================================================================
// HTTP Uploader
// =============================================================================

/// Multipart POST uploader for the device's update endpoints.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    firmware_url: Url,
    filesystem_url: Url,
    field_name: String,
    credentials: Option<Credentials>,
}

impl HttpUploader {
    pub fn from_config(config: &LinkConfig) -> LinkResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.upload.timeout_secs))
            .connect_timeout(Duration::from_millis(config.transport.connect_timeout_ms))
            .build()?;

        Ok(HttpUploader {
            client,
            firmware_url: config.upload_url(UploadTarget::Firmware)?,
            filesystem_url: config.upload_url(UploadTarget::Filesystem)?,
            field_name: config.upload.field_name.clone(),
            credentials: config.credentials(),
        })
    }

    fn url_for(&self, target: UploadTarget) -> &Url {
        match target {
            UploadTarget::Firmware => &self.firmware_url,
            UploadTarget::Filesystem => &self.filesystem_url,
        }
    }
}

impl Uploader for HttpUploader {
    fn start(
        &self,
        request: UploadRequest,
        signals: mpsc::UnboundedSender<UploadSignal>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        let url = self.url_for(request.target).clone();
        let field_name = self.field_name.clone();
        let credentials = self.credentials.clone();

        tokio::spawn(async move {
            debug!(url = %url, file = %request.file_name, "Posting image");
            let total = request.bytes.len() as u64;
            match post_image(client, url, field_name, credentials, request, &signals).await {
                Ok(status) => {
                    if (200..300).contains(&status) {
                        // The device answered after reading the whole body.
                        let _ = signals.send(UploadSignal::Progress { sent: total, total });
                    }
                    let _ = signals.send(UploadSignal::Response { status });
                }
                Err(e) if e.is_timeout() => {
                    let _ = signals.send(UploadSignal::TimedOut);
                }
                Err(e) => {
                    let _ = signals.send(UploadSignal::NetworkError(e.to_string()));
                }
            }
            let _ = signals.send(UploadSignal::Ended);
        })
    }
}

async fn post_image(
    client: Client,
    url: Url,
    field_name: String,
    credentials: Option<Credentials>,
    request: UploadRequest,
    signals: &mpsc::UnboundedSender<UploadSignal>,
) -> Result<u16, reqwest::Error> {
    let total = request.bytes.len() as u64;
    let body = BodyProgress::new(request.bytes, signals.clone()).into_stream();

    let part = Part::stream_with_length(Body::wrap_stream(body), total)
        .file_name(request.file_name)
        .mime_str("application/octet-stream")?;
    let form = Form::new().part(field_name, part);

    let mut builder = client.post(url).multipart(form);
    if let Some(credentials) = credentials {
        builder = builder.basic_auth(credentials.username, Some(credentials.password));
    }

    let response = builder.send().await?;
    Ok(response.status().as_u16())
}

/// Image body handed out one chunk at a time as the HTTP client asks for it.
///
/// A chunk counts as sent once the client comes back for the next one. The
/// socket buffers still hold an unknown tail, so the last chunk is never
/// counted here: 100% is only reported with the device's answer.
struct BodyProgress {
    bytes: Vec<u8>,
    offset: usize,
    reported: u64,
    ceiling: u64,
    signals: mpsc::UnboundedSender<UploadSignal>,
}

impl BodyProgress {
    fn new(bytes: Vec<u8>, signals: mpsc::UnboundedSender<UploadSignal>) -> Self {
        let total = bytes.len();
        let last_chunk = match total % CHUNK_SIZE {
            0 => CHUNK_SIZE.min(total),
            rest => rest,
        };
        BodyProgress {
            ceiling: (total - last_chunk) as u64,
            bytes,
            offset: 0,
            reported: 0,
            signals,
        }
    }

    fn into_stream(self) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> + Send {
        futures_util::stream::unfold(self, |mut body| async move {
            body.report_taken();
            let chunk = body.next_chunk()?;
            Some((Ok(chunk), body))
        })
    }

    fn report_taken(&mut self) {
        let sent = (self.offset as u64).min(self.ceiling);
        if sent > self.reported {
            self.reported = sent;
            let _ = self.signals.send(UploadSignal::Progress {
                sent,
                total: self.bytes.len() as u64,
            });
        }
    }

    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let end = (self.offset + CHUNK_SIZE).min(self.bytes.len());
        let chunk = self.bytes[self.offset..end].to_vec();
        self.offset = end;
        Some(chunk)
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Tunables for [`UploadMonitor`].
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    /// Quiet period after 100% before success is assumed.
    pub grace: Duration,
    pub resolver: ResolverSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            resolver: ResolverSettings::default(),
        }
    }
}

/// What the monitor reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Whole-percent progress changed.
    Progress {
        attempt: UploadAttemptId,
        target: UploadTarget,
        percent: u8,
    },
    /// The attempt resolved. Emitted once per attempt.
    Resolved {
        attempt: UploadAttemptId,
        target: UploadTarget,
        outcome: UploadOutcome,
    },
}

struct ActiveUpload {
    id: UploadAttemptId,
    target: UploadTarget,
    resolver: OutcomeResolver,
    signals: mpsc::UnboundedReceiver<UploadSignal>,
    grace: Timer,
    reported_percent: Option<u8>,
}

enum Wake {
    Signal(Option<UploadSignal>),
    Grace,
}

/// Runs at most one upload attempt at a time.
pub struct UploadMonitor {
    uploader: Arc<dyn Uploader>,
    settings: MonitorSettings,
    active: Option<ActiveUpload>,
    request: Option<JoinHandle<()>>,
}

impl UploadMonitor {
    pub fn new(uploader: Arc<dyn Uploader>, settings: MonitorSettings) -> Self {
        UploadMonitor {
            uploader,
            settings,
            active: None,
            request: None,
        }
    }

    /// Returns true while an attempt has not resolved.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Starts an attempt.
    ///
    /// Fails with `InvalidPayload` on an empty image and `UploadInProgress`
    /// while another attempt is pending.
    pub fn start(
        &mut self,
        target: UploadTarget,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> LinkResult<UploadAttemptId> {
        validate_payload(&bytes)?;
        if self.active.is_some() {
            return Err(LinkError::UploadInProgress);
        }

        if let Some(previous) = self.request.take() {
            previous.abort();
        }

        let id = UploadAttemptId::new();
        let size = bytes.len();
        let (tx, rx) = mpsc::unbounded_channel();
        let request = UploadRequest {
            target,
            file_name: file_name.into(),
            bytes,
        };

        self.request = Some(self.uploader.start(request, tx));
        self.active = Some(ActiveUpload {
            id,
            target,
            resolver: OutcomeResolver::new(self.settings.resolver),
            signals: rx,
            grace: None,
            reported_percent: None,
        });

        info!(attempt = %id, %target, size, "Upload started");
        Ok(id)
    }

    /// Waits for the next progress change or resolution. Cancel-safe.
    pub async fn next_event(&mut self) -> MonitorEvent {
        loop {
            let Some(active) = self.active.as_mut() else {
                return std::future::pending().await;
            };

            let wake = tokio::select! {
                signal = active.signals.recv() => Wake::Signal(signal),
                _ = timer::fired(&mut active.grace) => Wake::Grace,
            };

            if let Some(event) = self.handle_wake(wake) {
                return event;
            }
        }
    }

    fn handle_wake(&mut self, wake: Wake) -> Option<MonitorEvent> {
        let active = self.active.as_mut()?;

        let resolution = match wake {
            Wake::Signal(Some(signal)) => {
                debug!(attempt = %active.id, ?signal, "Upload signal");
                active.resolver.on_signal(&signal)
            }
            Wake::Signal(None) => {
                warn!(attempt = %active.id, "Upload task ended without a result");
                active
                    .resolver
                    .on_signal(&UploadSignal::NetworkError("upload task ended".into()))
            }
            Wake::Grace => {
                active.grace = None;
                active.resolver.on_grace_elapsed()
            }
        };

        match resolution {
            Resolution::Resolved(outcome) => {
                let active = self.active.take()?;
                info!(attempt = %active.id, ?outcome, "Upload resolved");
                Some(MonitorEvent::Resolved {
                    attempt: active.id,
                    target: active.target,
                    outcome,
                })
            }
            Resolution::StartGrace => {
                active.grace = timer::start(self.settings.grace);
                progress_event(active)
            }
            Resolution::Pending => progress_event(active),
            Resolution::Ignored => None,
        }
    }
}

impl Drop for UploadMonitor {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            request.abort();
        }
    }
}

fn progress_event(active: &mut ActiveUpload) -> Option<MonitorEvent> {
    let percent = active.resolver.percent();
    if active.reported_percent == Some(percent) {
        return None;
    }
    active.reported_percent = Some(percent);
    Some(MonitorEvent::Progress {
        attempt: active.id,
        target: active.target,
        percent,
    })
}
