//! Per-step outcome of a relay teardown
//!
//! Teardown never fails as a whole. Each step records what it released or
//! the error it hit, and the remaining steps still run.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::chain::StageKind;

/// A single teardown step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Terminate(StageKind),
    Poll(StageKind),
    Kill(StageKind),
    Reap(StageKind),
    RemoveArtifact,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::Terminate(stage) => write!(f, "terminate {}", stage),
            TeardownStep::Poll(stage) => write!(f, "poll {}", stage),
            TeardownStep::Kill(stage) => write!(f, "kill {}", stage),
            TeardownStep::Reap(stage) => write!(f, "reap {}", stage),
            TeardownStep::RemoveArtifact => f.write_str("remove temporary file"),
        }
    }
}

/// A teardown step that failed
#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct TeardownError {
    pub step: TeardownStep,
    #[source]
    pub source: io::Error,
}

/// What a teardown released
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// The receiver socket was closed by this teardown
    pub socket_closed: bool,

    /// Stages sent SIGTERM, in order
    pub terminated: Vec<StageKind>,

    /// Stages still alive after the grace period and killed, in order
    pub killed: Vec<StageKind>,

    /// Exit status of every reaped stage
    pub exit_statuses: Vec<(StageKind, ExitStatus)>,

    /// Temporary file that was deleted
    pub artifact_removed: Option<PathBuf>,

    /// Steps that failed
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn record(&mut self, step: TeardownStep, source: io::Error) {
        self.errors.push(TeardownError { step, source });
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log the failed steps
    pub fn log_errors(&self) {
        for err in &self.errors {
            match err.step {
                TeardownStep::RemoveArtifact => {
                    tracing::warn!("Could not remove temporary file: {}", err.source)
                }
                step => tracing::error!(%step, "Teardown step failed: {}", err.source),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_records_errors() {
        let mut report = TeardownReport::default();
        assert!(report.is_clean());

        report.record(
            TeardownStep::Kill(StageKind::Encoder),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        report.record(
            TeardownStep::RemoveArtifact,
            io::Error::new(io::ErrorKind::Other, "busy"),
        );

        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].to_string(), "kill encoder failed: denied");
        assert_eq!(report.errors[1].step, TeardownStep::RemoveArtifact);
        report.log_errors();
    }
}
