// Fire-and-forget completion reports to the gateway.
use faas_common::CompletionReport;
use reqwest::StatusCode;

use crate::errors::MessageError;

pub const REPORT_PATH: &str = "/system/async-report";

#[derive(Debug, Clone)]
pub struct ReportEmitter {
    client: reqwest::Client,
    url: String,
}

impl ReportEmitter {
    pub fn new(client: reqwest::Client, gateway_url: &str) -> Self {
        let url = format!("{}{}", gateway_url.trim_end_matches('/'), REPORT_PATH);
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts one report. A single attempt; the caller logs and drops failures.
    ///
    /// Non-2xx gateway responses count as failures.
    pub async fn emit(&self, report: &CompletionReport) -> Result<StatusCode, MessageError> {
        let report_err = |reason: String| MessageError::Report {
            function: report.function_name.clone(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|err| report_err(err.to_string()))?;
        let status = response.status();
        tracing::info!(
            function = %report.function_name,
            status = status.as_u16(),
            "Posting report - {}",
            status.as_u16()
        );
        // Drain so the connection is released before the next message.
        if let Err(err) = response.bytes().await {
            tracing::debug!(error = %err, "report response body unreadable");
        }
        if !status.is_success() {
            return Err(report_err(format!("gateway responded {status}")));
        }
        Ok(status)
    }
}
