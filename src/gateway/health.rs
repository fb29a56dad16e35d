use chrono::Utc;

use crate::db::models::EndpointStatus;
use crate::db::Database;
use crate::error::GatewayResult;
use crate::gateway::executor::RemoteResponse;

const MAX_SUMMARY_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: EndpointStatus,
    pub summary: String,
}

impl HealthReport {
    /// Any answer from the remote side counts as reachable, except an
    /// explicit rejection of the credentials.
    pub fn assess(outcome: &GatewayResult<RemoteResponse>) -> Self {
        match outcome {
            Ok(response) if matches!(response.status_code, 401 | 403) => Self {
                status: EndpointStatus::Error,
                summary: format!("Authentication rejected (HTTP {})", response.status_code),
            },
            Ok(response) if response.is_success() => Self {
                status: EndpointStatus::Active,
                summary: format!("Connection OK (HTTP {})", response.status_code),
            },
            Ok(response) => Self {
                status: EndpointStatus::Active,
                summary: format!("Remote responded with HTTP {}", response.status_code),
            },
            Err(err) => Self {
                status: EndpointStatus::Error,
                summary: truncate(&err.to_string()),
            },
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == EndpointStatus::Active
    }
}

/// Persists the outcome of every test/execute call.
pub struct HealthRecorder<'a> {
    db: &'a Database,
}

impl<'a> HealthRecorder<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// A failed write is logged and does not replace the call outcome.
    pub async fn record(
        &self,
        endpoint_id: &str,
        outcome: &GatewayResult<RemoteResponse>,
    ) -> HealthReport {
        let report = HealthReport::assess(outcome);
        if let Err(e) = self
            .db
            .record_health(endpoint_id, report.status, &report.summary, Utc::now())
            .await
        {
            tracing::error!("Failed to record health for endpoint {}: {}", endpoint_id, e);
        }
        if !report.is_healthy() {
            tracing::warn!("Endpoint {} unhealthy: {}", endpoint_id, report.summary);
        }
        report
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_SUMMARY_LEN {
        return message.to_string();
    }
    let mut end = MAX_SUMMARY_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
