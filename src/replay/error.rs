//! Controller error taxonomy

use crate::replay::types::ResponseRecord;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The replay process could not be started or never became ready
    #[error("failed to launch replay session: {0}")]
    LaunchFailure(String),

    #[error("no active replay session, start one with rr_replay first")]
    NoActiveSession,

    /// Completion never observed; records seen so far are kept
    #[error("timed out after {}ms waiting for the command to complete", .timeout.as_millis())]
    Timeout {
        timeout: Duration,
        records: Vec<ResponseRecord>,
    },

    #[error("replay session ended before the command completed")]
    SessionEnded { records: Vec<ResponseRecord> },

    #[error("failed to write command to the debugger: {0}")]
    WriteFailure(#[source] std::io::Error),
}

impl ControllerError {
    /// Records accumulated before the wait gave up
    pub fn records(&self) -> &[ResponseRecord] {
        match self {
            ControllerError::Timeout { records, .. }
            | ControllerError::SessionEnded { records } => records,
            _ => &[],
        }
    }
}
