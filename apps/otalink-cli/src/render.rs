//! Event rendering for the terminal.

use otalink_core::{AssumedSuccess, LinkEvent, ReadyCause, UploadOutcome};

/// How events are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Human,
    JsonLines,
}

/// Renders one event as a single output line.
pub fn render(event: &LinkEvent, format: Format) -> anyhow::Result<String> {
    match format {
        Format::Human => Ok(human(event)),
        Format::JsonLines => Ok(serde_json::to_string(event)?),
    }
}

fn human(event: &LinkEvent) -> String {
    match event {
        LinkEvent::Connected => "connected".to_string(),
        LinkEvent::Disconnected {
            reconnect_in_ms: Some(ms),
        } => format!("disconnected, reconnecting in {:.1}s", *ms as f64 / 1000.0),
        LinkEvent::Disconnected {
            reconnect_in_ms: None,
        } => "disconnected".to_string(),
        LinkEvent::LogLine { line, received_at } => {
            format!("[{}] {}", received_at.format("%H:%M:%S"), line)
        }
        LinkEvent::UploadProgress {
            target, percent, ..
        } => format!("{} upload {:>3}%", target, percent),
        LinkEvent::UploadResolved {
            target, outcome, ..
        } => match outcome {
            UploadOutcome::Succeeded => format!("{} upload succeeded", target),
            UploadOutcome::AssumedSucceeded { evidence } => {
                format!("{} upload assumed successful ({})", target, evidence_text(evidence))
            }
            UploadOutcome::Failed { reason } => format!("{} upload failed: {}", target, reason),
            UploadOutcome::Pending => format!("{} upload pending", target),
        },
        LinkEvent::DeviceReady { cause } => match cause {
            ReadyCause::Marker => "device ready".to_string(),
            ReadyCause::Fallback => "device ready (no ready marker seen)".to_string(),
            ReadyCause::ReconnectDeadline => {
                "device did not come back in time, resuming normal operation".to_string()
            }
        },
    }
}

fn evidence_text(evidence: &AssumedSuccess) -> String {
    match evidence {
        AssumedSuccess::GraceElapsed => "no response after 100%".to_string(),
        AssumedSuccess::EndedAfterComplete => "connection ended after 100%".to_string(),
        AssumedSuccess::ErrorNearComplete { percent } => {
            format!("connection dropped at {}%", percent)
        }
        AssumedSuccess::TimeoutAfterComplete => "timed out after 100%".to_string(),
    }
}
