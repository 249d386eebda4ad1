use std::sync::Mutex;

use tracing::warn;

use crate::domain::{DeadLetterQueue, Error};

/// Logs every rejected command at `warn` with both the internal error and the
/// message a player would see.
#[derive(Default, Debug)]
pub struct TracingDLQ {}

impl DeadLetterQueue for TracingDLQ {
    fn report(&self, error: &Error) {
        warn!(error = %error, public = %error.public_message(), "command rejected");
    }
}

/// Keeps rejected commands' messages for later inspection.
#[derive(Default, Debug)]
pub struct CollectingDLQ {
    reports: Mutex<Vec<String>>,
}

impl CollectingDLQ {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl DeadLetterQueue for CollectingDLQ {
    fn report(&self, error: &Error) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(error.to_string());
        }
    }
}
