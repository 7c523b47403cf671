use crate::protocol::ReportPayload;
use crate::sink::{ReportError, ReportSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sink that keeps every payload it receives. Fails every send while `failing` is set,
/// still recording the attempt.
#[derive(Default)]
pub struct RecordingSink {
    payloads: Mutex<Vec<ReportPayload>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn payloads(&self) -> Vec<ReportPayload> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn send(&self, payload: &ReportPayload) -> Result<(), ReportError> {
        self.payloads.lock().push(payload.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReportError::Status(StatusCode::BAD_GATEWAY));
        }
        Ok(())
    }
}
