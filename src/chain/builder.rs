//! Process chain construction and shutdown
//!
//! ```text
//! forwarding loop ──stdin──▶ decoder ──pipe──▶ encoder ──pipe──▶ streamer -c <tmp>
//! ```
//!
//! Stages are created in order and shut down in the same order. Shutting
//! the decoder down first closes its end of the decoder→encoder pipe, which
//! lets the downstream stages see EOF or a broken pipe.

use std::process::{ChildStdin, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::chain::stage::{StageKind, StageProcess};
use crate::chain::template::{self, RemoveOutcome, TempArtifact};
use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::teardown::{TeardownReport, TeardownStep};

/// Interval between liveness checks during the grace period
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The running stages, the head-of-chain input and the rendered config file
#[derive(Debug, Default)]
pub struct ProcessChain {
    stages: Vec<StageProcess>,
    input: Option<ChildStdin>,
    artifact: Option<TempArtifact>,
}

impl ProcessChain {
    /// Take the decoder's stdin for the forwarding loop
    pub fn take_input(&mut self) -> Option<ChildStdin> {
        self.input.take()
    }

    /// Stages in creation order
    pub fn stages(&self) -> &[StageProcess] {
        &self.stages
    }

    /// PIDs in creation order
    pub fn pids(&self) -> Vec<u32> {
        self.stages.iter().map(StageProcess::pid).collect()
    }

    /// Path of the rendered streamer configuration, if written
    pub fn artifact_path(&self) -> Option<&std::path::Path> {
        self.artifact.as_ref().map(TempArtifact::path)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.artifact.is_none()
    }

    /// Terminate, wait, kill and reap every stage, then delete the artifact.
    ///
    /// Every step runs even if an earlier one failed. Calling this again
    /// on a shut-down chain does nothing.
    pub fn shutdown(&mut self, grace_period: Duration, report: &mut TeardownReport) {
        // Our end of the decoder's stdin, if the loop never took it
        self.input.take();

        for stage in &mut self.stages {
            tracing::debug!(stage = %stage.kind(), pid = stage.pid(), "Terminating stage");
            match stage.terminate() {
                Ok(true) => report.terminated.push(stage.kind()),
                Ok(false) => {}
                Err(e) => report.record(TeardownStep::Terminate(stage.kind()), e),
            }
        }

        if !self.stages.is_empty() {
            self.wait_for_exit(grace_period, report);
        }

        for stage in &mut self.stages {
            let kind = stage.kind();
            let alive = match stage.is_alive() {
                Ok(alive) => alive,
                Err(e) => {
                    report.record(TeardownStep::Poll(kind), e);
                    true
                }
            };

            if alive {
                tracing::info!(stage = %kind, pid = stage.pid(), "Killing stage");
                if let Err(e) = stage.kill() {
                    report.record(TeardownStep::Kill(kind), e);
                    // Never block on a stage we failed to kill
                    continue;
                }
                report.killed.push(kind);
            }

            match stage.reap() {
                Ok(status) => {
                    tracing::debug!(stage = %kind, %status, "Stage exited");
                    report.exit_statuses.push((kind, status));
                }
                Err(e) => report.record(TeardownStep::Reap(kind), e),
            }
        }
        self.stages.clear();

        if let Some(artifact) = self.artifact.take() {
            tracing::debug!(path = %artifact.path().display(), "Erasing streamer configuration");
            match artifact.remove() {
                Ok(RemoveOutcome::Removed(path)) => report.artifact_removed = Some(path),
                Ok(RemoveOutcome::Left(_)) => {}
                Err(e) => report.record(TeardownStep::RemoveArtifact, e),
            }
        }
    }

    /// Wait up to `grace_period` for all stages to exit
    fn wait_for_exit(&mut self, grace_period: Duration, report: &mut TeardownReport) {
        let deadline = Instant::now() + grace_period;
        loop {
            let mut any_alive = false;
            for stage in &mut self.stages {
                match stage.is_alive() {
                    Ok(alive) => any_alive |= alive,
                    Err(e) => {
                        report.record(TeardownStep::Poll(stage.kind()), e);
                        return;
                    }
                }
            }

            let now = Instant::now();
            if !any_alive || now >= deadline {
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Builds a [`ProcessChain`] from configuration
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    config: ChainConfig,
    grace_period: Duration,
}

impl ChainBuilder {
    pub fn new(config: ChainConfig, grace_period: Duration) -> Self {
        Self {
            config,
            grace_period,
        }
    }

    /// Start decoder, encoder and streamer for `mount`.
    ///
    /// On failure everything started so far is shut down before the error
    /// is returned.
    pub fn build(&self, mount: &str) -> Result<ProcessChain, ChainError> {
        let mut chain = ProcessChain::default();

        match self.populate(&mut chain, mount) {
            Ok(()) => Ok(chain),
            Err(e) => {
                tracing::error!(mount, "Chain construction failed: {}", e);
                let mut report = TeardownReport::default();
                chain.shutdown(self.grace_period, &mut report);
                report.log_errors();
                Err(e)
            }
        }
    }

    fn populate(&self, chain: &mut ProcessChain, mount: &str) -> Result<(), ChainError> {
        let no_args: [&str; 0] = [];

        // Stage 1: stdin stays with us for forwarding
        let mut decoder = StageProcess::spawn(
            StageKind::Decoder,
            &self.config.decoder,
            no_args,
            Stdio::piped(),
            Stdio::piped(),
        )?;
        chain.input = decoder.take_stdin();
        let decoder_out = decoder.take_stdout();
        chain.stages.push(decoder);
        let decoder_out = decoder_out.ok_or(ChainError::MissingPipe {
            stage: StageKind::Decoder.name(),
            stream: "stdout",
        })?;
        if chain.input.is_none() {
            return Err(ChainError::MissingPipe {
                stage: StageKind::Decoder.name(),
                stream: "stdin",
            });
        }

        // Stage 2: fed by the decoder
        let mut encoder = StageProcess::spawn(
            StageKind::Encoder,
            &self.config.encoder,
            no_args,
            Stdio::from(decoder_out),
            Stdio::piped(),
        )?;
        let encoder_out = encoder.take_stdout();
        chain.stages.push(encoder);
        let encoder_out = encoder_out.ok_or(ChainError::MissingPipe {
            stage: StageKind::Encoder.name(),
            stream: "stdout",
        })?;

        // Stage 3: rendered config first, then the streamer itself
        let rendered = template::render_file(&self.config.template_path, mount)?;
        let artifact = TempArtifact::create(
            &self.config.artifact_dir(),
            &self.config.artifact_suffix,
            &rendered,
        )?;
        let artifact_path = artifact.path().to_path_buf();
        chain.artifact = Some(artifact);

        let streamer = StageProcess::spawn(
            StageKind::Streamer,
            &self.config.streamer,
            [artifact_path.as_os_str()],
            Stdio::from(encoder_out),
            Stdio::inherit(),
        )?;
        chain.stages.push(streamer);

        Ok(())
    }
}
