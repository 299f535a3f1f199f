//! # Status Poller
//!
//! Periodically reads the device status document and forwards the Wi-Fi
//! RSSI to the link manager, where it stretches reconnect delays on a weak
//! signal. Every other field of the document is ignored.
//!
//! Polling is skipped while the device reboots after an update.

use std::time::Duration;

use reqwest::Client;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LinkConfig;
use crate::error::{LinkError, LinkResult};
use crate::manager::LinkHandle;

/// Polls `GET /api/status` and reports RSSI.
pub struct StatusPoller {
    client: Client,
    url: Url,
    interval: Duration,
    handle: LinkHandle,
}

impl StatusPoller {
    pub fn from_config(config: &LinkConfig, handle: LinkHandle) -> LinkResult<Self> {
        let interval = Duration::from_secs(config.status.interval_secs);
        let client = Client::builder()
            .timeout(interval)
            .connect_timeout(Duration::from_millis(config.transport.connect_timeout_ms))
            .build()?;

        Ok(StatusPoller {
            client,
            url: config.status_url()?,
            interval,
            handle,
        })
    }

    /// Polls until the manager shuts down.
    pub async fn run(self) {
        info!(url = %self.url, interval = ?self.interval, "Status poller starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.handle.status().await {
                Ok(status) if status.is_rebooting() => {
                    debug!("Device rebooting, status poll skipped");
                    continue;
                }
                Ok(_) => {}
                Err(_) => break,
            }

            match self.fetch_rssi().await {
                Ok(Some(rssi)) => {
                    if self.handle.report_rssi(rssi).await.is_err() {
                        break;
                    }
                }
                Ok(None) => debug!("Status document has no rssi"),
                Err(e) => warn!(error = %e, "Status poll failed"),
            }
        }

        info!("Status poller stopped");
    }

    async fn fetch_rssi(&self) -> LinkResult<Option<i32>> {
        let response = self.client.get(self.url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(LinkError::HttpError(format!(
                "status endpoint answered {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        parse_rssi(&body)
    }
}

/// Extracts the integer `rssi` field from a status document.
pub fn parse_rssi(body: &str) -> LinkResult<Option<i32>> {
    let document: serde_json::Value = serde_json::from_str(body)?;
    Ok(document
        .get("rssi")
        .and_then(serde_json::Value::as_i64)
        .and_then(|rssi| i32::try_from(rssi).ok()))
}
