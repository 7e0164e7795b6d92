// Per-message failures. None of these stop the consumer: each is logged where
// it happens, counted, and the pipeline moves on to the next stage.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("malformed invocation request: {0}")]
    Decode(String),
    #[error("invoke {function}: {reason}")]
    Invoke { function: String, reason: String },
    #[error("read response body from {function}: {reason}")]
    ReadBody { function: String, reason: String },
    #[error("post completion report for {function}: {reason}")]
    Report { function: String, reason: String },
    #[error("ack message {sequence}: {reason}")]
    Ack { sequence: u64, reason: String },
}

impl MessageError {
    // Stable label for the per-kind error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Invoke { .. } => "invoke",
            Self::ReadBody { .. } => "read_body",
            Self::Report { .. } => "report",
            Self::Ack { .. } => "ack",
        }
    }
}
