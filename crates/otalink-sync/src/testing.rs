//! In-memory connector and uploader for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use otalink_core::UploadSignal;

use crate::error::{LinkError, LinkResult};
use crate::transport::{Connection, Connector, RemoteEnd};
use crate::upload::{UploadRequest, Uploader};

/// How a fake connection attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dial {
    Accept,
    Refuse,
    Hang,
}

struct ConnectorState {
    attempts: AtomicUsize,
    default: Mutex<Dial>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

/// Connector whose accepted sockets are handed to the test as [`RemoteEnd`]s.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    pub(crate) fn new(default: Dial) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = FakeConnector {
            state: Arc::new(ConnectorState {
                attempts: AtomicUsize::new(0),
                default: Mutex::new(default),
                remotes: tx,
            }),
        };
        (connector, rx)
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn set_default(&self, dial: Dial) {
        *self.state.default.lock().unwrap() = dial;
    }
}

impl Connector for FakeConnector {
    fn connect(&self) -> BoxFuture<'static, LinkResult<Connection>> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let dial = *self.state.default.lock().unwrap();

        match dial {
            Dial::Accept => {
                let (connection, remote) = Connection::channel();
                let _ = self.state.remotes.send(remote);
                Box::pin(async move { Ok(connection) })
            }
            Dial::Refuse => Box::pin(async {
                Err(LinkError::ConnectionFailed("connection refused".into()))
            }),
            Dial::Hang => Box::pin(std::future::pending()),
        }
    }
}

/// One upload handed to [`FakeUploader`], with the signal sender the test drives.
pub(crate) struct StartedUpload {
    pub(crate) request: UploadRequest,
    pub(crate) signals: mpsc::UnboundedSender<UploadSignal>,
}

/// Uploader that lets the test play the HTTP transport.
pub(crate) struct FakeUploader {
    started: mpsc::UnboundedSender<StartedUpload>,
}

impl FakeUploader {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<StartedUpload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FakeUploader { started: tx }, rx)
    }
}

impl Uploader for FakeUploader {
    fn start(
        &self,
        request: UploadRequest,
        signals: mpsc::UnboundedSender<UploadSignal>,
    ) -> JoinHandle<()> {
        let _ = self.started.send(StartedUpload { request, signals });
        tokio::spawn(async {})
    }
}
