//! Invocation dispatch.
//!
//! # Purpose
//! Turns one [`InvocationRequest`] into one HTTP call to the target function,
//! times it, and always follows up with exactly one completion report.
//!
//! # Key invariants
//! - A transport failure (no response at all) yields [`SERVICE_UNAVAILABLE`].
//! - When a response arrives its status is the outcome, whether or not the
//!   body could be read.
//! - The report is attempted after the invocation settles, never before and
//!   never skipped.
use faas_common::{InvocationOutcome, InvocationRequest, SERVICE_UNAVAILABLE};
use std::sync::Arc;
use std::time::Instant;

use crate::errors::MessageError;
use crate::report::ReportEmitter;
use crate::resolver::FunctionResolver;

// Function output is logged for debugging only; cap what goes to the log.
const MAX_LOGGED_BODY_BYTES: usize = 4 * 1024;

/// Everything one dispatch produced.
#[derive(Debug)]
pub struct Dispatched {
    pub outcome: InvocationOutcome,
    // Gateway status when the report went through.
    pub report_status: Option<u16>,
    // Recoverable failures observed along the way, already logged.
    pub errors: Vec<MessageError>,
}

pub struct Dispatcher {
    client: reqwest::Client,
    resolver: Arc<dyn FunctionResolver>,
    reporter: ReportEmitter,
}

impl Dispatcher {
    pub fn new(
        client: reqwest::Client,
        resolver: Arc<dyn FunctionResolver>,
        reporter: ReportEmitter,
    ) -> Self {
        Self {
            client,
            resolver,
            reporter,
        }
    }

    /// Invokes the function, then reports the outcome.
    pub async fn dispatch(&self, request: &InvocationRequest) -> Dispatched {
        let mut errors = Vec::new();
        let outcome = self.invoke(request, &mut errors).await;

        metrics::histogram!("faas_worker_invocation_seconds").record(outcome.elapsed_seconds());
        let report_status = match self.reporter.emit(&outcome.to_report()).await {
            Ok(status) => Some(status.as_u16()),
            Err(err) => {
                tracing::warn!(error = %err, "completion report not delivered");
                errors.push(err);
                None
            }
        };
        Dispatched {
            outcome,
            report_status,
            errors,
        }
    }

    /// Performs the single POST to the function and measures it.
    pub async fn invoke(
        &self,
        request: &InvocationRequest,
        errors: &mut Vec<MessageError>,
    ) -> InvocationOutcome {
        let url = self.resolver.function_url(&request.function);
        tracing::info!(function = %request.function, url = %url, "Request for {}.", request.function);

        let started = Instant::now();
        let sent = self
            .client
            .post(&url)
            .body(request.body.clone())
            .send()
            .await;
        let mut response = match sent {
            Ok(response) => response,
            Err(err) => {
                let elapsed = started.elapsed();
                let err = MessageError::Invoke {
                    function: request.function.clone(),
                    reason: err.to_string(),
                };
                tracing::warn!(error = %err, elapsed_s = elapsed.as_secs_f64(), "function call failed");
                errors.push(err);
                return InvocationOutcome {
                    function: request.function.clone(),
                    status_code: SERVICE_UNAVAILABLE,
                    elapsed,
                };
            }
        };

        let status = response.status();
        // Read to the end so the connection is released; keep only a prefix.
        let mut shown = Vec::new();
        let mut total = 0usize;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    total += chunk.len();
                    let room = MAX_LOGGED_BODY_BYTES.saturating_sub(shown.len());
                    shown.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Ok(None) => {
                    tracing::debug!(
                        function = %request.function,
                        bytes = total,
                        body = %String::from_utf8_lossy(&shown),
                        "function response body"
                    );
                    break;
                }
                Err(err) => {
                    let err = MessageError::ReadBody {
                        function: request.function.clone(),
                        reason: err.to_string(),
                    };
                    tracing::warn!(error = %err, bytes = total, "function response body unreadable");
                    errors.push(err);
                    break;
                }
            }
        }
        let elapsed = started.elapsed();
        tracing::info!(
            function = %request.function,
            status = %status,
            elapsed_s = elapsed.as_secs_f64(),
            "function returned"
        );
        InvocationOutcome {
            function: request.function.clone(),
            status_code: status.as_u16(),
            elapsed,
        }
    }
}
