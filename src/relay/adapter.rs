//! Relay lifecycle controller
//!
//! An [`Adapter`] owns the UDP receiver, the process chain and the
//! forwarding thread for one `port -> mount` relay. Its state only moves
//! forward:
//!
//! ```text
//! Ready ──start()──▶ Starting ──▶ Running ──stop()/error──▶ Stopped
//!   │                   │                                     ▲
//!   └───────────────────┴──────────── destroy() ──────────────┘
//! ```
//!
//! Teardown is idempotent. It runs from whichever of these gets there
//! first: the forwarding thread's exit guard, an explicit `destroy()`, a
//! failed `start()`, or `Drop`. Later calls find nothing left to release.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::chain::{ChainBuilder, ProcessChain, StageKind};
use crate::config::{AppConfig, NetworkConfig};
use crate::error::{AdapterError, ChainError, Result};
use crate::network::DatagramReceiver;
use crate::relay::forward::{forward_loop, LoopCounters, LoopExit, RelayStats};
use crate::teardown::TeardownReport;

/// Lifecycle state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Constructed, nothing started
    Ready,
    /// `start()` is setting up the socket and chain
    Starting,
    /// Forwarding loop active
    Running,
    /// Torn down; terminal
    Stopped,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterState::Ready => "ready",
            AdapterState::Starting => "starting",
            AdapterState::Running => "running",
            AdapterState::Stopped => "stopped",
        })
    }
}

/// Resources released by teardown
#[derive(Default)]
struct Resources {
    chain: Option<ProcessChain>,
    torn_down: bool,
}

/// State shared with the forwarding thread
struct Shared {
    /// `port -> mount`, for log lines
    label: String,

    grace_period: Duration,

    state: Mutex<AdapterState>,

    running: AtomicBool,

    /// Set by `stop()`; `start()` checks it after publishing each resource
    stop_requested: AtomicBool,

    /// Kept apart from `resources` so `stop()` never waits on a teardown
    receiver: Mutex<Option<Arc<DatagramReceiver>>>,

    /// Held for the whole teardown sequence
    resources: Mutex<Resources>,

    counters: LoopCounters,

    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    /// Release everything exactly once.
    ///
    /// Returns `None` when an earlier call already tore the adapter down.
    fn teardown(&self) -> Option<TeardownReport> {
        let mut resources = self.resources.lock();
        if resources.torn_down {
            return None;
        }
        resources.torn_down = true;

        tracing::info!(relay = %self.label, "Destroying relay");
        *self.state.lock() = AdapterState::Stopped;
        self.running.store(false, Ordering::SeqCst);

        let mut report = TeardownReport::default();

        if let Some(receiver) = self.receiver.lock().take() {
            report.socket_closed = receiver.close();
        }

        if let Some(mut chain) = resources.chain.take() {
            chain.shutdown(self.grace_period, &mut report);
        }

        report.log_errors();
        tracing::info!(
            relay = %self.label,
            terminated = report.terminated.len(),
            killed = report.killed.len(),
            "Destroy complete"
        );
        Some(report)
    }
}

/// Runs teardown when the forwarding thread exits, including by panic
struct TeardownGuard(Arc<Shared>);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.0.teardown();
    }
}

/// Forwarding thread handle plus its completion signal
struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread finishes
    done: Receiver<()>,
}

/// Relays datagrams from a local UDP port into a decoder → encoder →
/// streamer process chain publishing to `mount`
pub struct Adapter {
    port: u16,
    mount: String,
    network: NetworkConfig,
    builder: ChainBuilder,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Adapter {
    /// Create an adapter in the `Ready` state
    pub fn new(port: u16, mount: impl Into<String>, config: AppConfig) -> Self {
        let mount = mount.into();
        let label = format!("{} -> {}", port, mount);

        tracing::info!(relay = %label, "Relay created");

        Self {
            port,
            mount,
            network: config.network,
            builder: ChainBuilder::new(config.chain, config.teardown.grace_period()),
            shared: Arc::new(Shared {
                label,
                grace_period: config.teardown.grace_period(),
                state: Mutex::new(AdapterState::Ready),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                receiver: Mutex::new(None),
                resources: Mutex::new(Resources::default()),
                counters: LoopCounters::default(),
                started_at: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Bind the socket, build the chain and launch the forwarding thread.
    ///
    /// Only valid from `Ready`. On failure everything set up so far is torn
    /// down and the adapter ends `Stopped`.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != AdapterState::Ready {
                return Err(AdapterError::InvalidState {
                    operation: "start",
                    state: *state,
                }
                .into());
            }
            *state = AdapterState::Starting;
        }

        tracing::info!(relay = %self.shared.label, "Starting relay");

        match self.setup() {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(relay = %self.shared.label, "Preparation failed: {}", e);
                self.shared.teardown();
                Err(e)
            }
        }
    }

    fn setup(&self) -> Result<()> {
        let receiver = Arc::new(DatagramReceiver::open(
            &self.network.bind_address,
            self.port,
            self.network.receive_timeout(),
            self.network.buffer_size,
        )?);

        // Publish the receiver before the slow part so a concurrent
        // stop() or destroy() can close it
        {
            let resources = self.shared.resources.lock();
            if resources.torn_down {
                receiver.close();
                return Err(self.stopped_during_start());
            }
            *self.shared.receiver.lock() = Some(receiver.clone());
        }
        // stop() either saw the published receiver or set the flag first
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            receiver.close();
        }

        let mut chain = self.builder.build(&self.mount)?;
        let input = match chain.take_input() {
            Some(input) => input,
            None => {
                let mut report = TeardownReport::default();
                chain.shutdown(self.shared.grace_period, &mut report);
                report.log_errors();
                return Err(ChainError::MissingPipe {
                    stage: StageKind::Decoder.name(),
                    stream: "stdin",
                }
                .into());
            }
        };

        {
            let mut resources = self.shared.resources.lock();
            if resources.torn_down {
                // destroy() ran while the chain was being built
                let mut report = TeardownReport::default();
                chain.shutdown(self.shared.grace_period, &mut report);
                report.log_errors();
                return Err(self.stopped_during_start());
            }
            resources.chain = Some(chain);
            // A stop() during setup leaves the flag clear; the loop then
            // exits at once and its guard tears down
            if !self.shared.stop_requested.load(Ordering::SeqCst) {
                self.shared.running.store(true, Ordering::SeqCst);
            }
            *self.shared.state.lock() = AdapterState::Running;
            *self.shared.started_at.lock() = Some(Utc::now());
        }

        let shared = self.shared.clone();
        let (done_tx, done_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("relay-{}", self.port))
            .spawn(move || {
                // Locals drop in reverse: the decoder input and socket go
                // first, then teardown runs, then waiters are released
                let _done = done_tx;
                let guard = TeardownGuard(shared);
                let receiver = receiver;
                let mut input = input;

                let shared = &guard.0;
                tracing::info!(relay = %shared.label, "Starting loop");
                match forward_loop(&receiver, &mut input, &shared.running, &shared.counters) {
                    LoopExit::Stopped | LoopExit::Closed => {}
                    LoopExit::ReceiveFailed(e) => {
                        tracing::error!(relay = %shared.label, "Receive failed: {}", e)
                    }
                    LoopExit::WriteFailed(e) => {
                        tracing::error!(
                            relay = %shared.label,
                            "Decoder stopped accepting data: {}",
                            e
                        )
                    }
                }
                tracing::info!(relay = %shared.label, "Loop terminated");
            })
            .map_err(AdapterError::ThreadSpawn)?;

        *self.worker.lock() = Some(Worker {
            handle,
            done: done_rx,
        });
        Ok(())
    }

    fn stopped_during_start(&self) -> crate::Error {
        AdapterError::InvalidState {
            operation: "start",
            state: AdapterState::Stopped,
        }
        .into()
    }

    /// Ask the forwarding loop to finish.
    ///
    /// Clears the running flag and closes the socket; the loop's exit path
    /// performs the teardown. A stop during `Starting` is remembered and
    /// honoured once setup has published the socket. Before `start()` it
    /// does nothing.
    pub fn stop(&self) {
        tracing::info!("Stopping {}", self);
        {
            let state = self.shared.state.lock();
            if *state == AdapterState::Ready {
                return;
            }
            self.shared.stop_requested.store(true, Ordering::SeqCst);
        }
        self.shared.running.store(false, Ordering::SeqCst);

        let receiver = self.shared.receiver.lock().clone();
        if let Some(receiver) = receiver {
            receiver.close();
        }
    }

    /// Tear the relay down now.
    ///
    /// Returns the report for the call that performed the teardown and
    /// `None` once the adapter is already torn down.
    pub fn destroy(&self) -> Option<TeardownReport> {
        self.shared.teardown()
    }

    /// Wait for the forwarding thread to finish and join it.
    ///
    /// Returns `false` if it is still running after `timeout`. Returns
    /// `true` immediately when no thread was ever started.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut worker = self.worker.lock();
        let finished = match worker.as_ref() {
            None => return true,
            Some(w) => match w.done.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                Err(RecvTimeoutError::Timeout) => false,
            },
        };

        if finished {
            if let Some(w) = worker.take() {
                if w.handle.join().is_err() {
                    tracing::error!(relay = %self.shared.label, "Forwarding thread panicked");
                }
            }
        }
        finished
    }

    pub fn state(&self) -> AdapterState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// Bound socket address while the receiver is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.receiver.lock().as_ref().map(|r| r.local_addr())
    }

    /// PIDs of the chain stages in creation order
    pub fn stage_pids(&self) -> Vec<u32> {
        self.shared
            .resources
            .lock()
            .chain
            .as_ref()
            .map(ProcessChain::pids)
            .unwrap_or_default()
    }

    /// Path of the rendered streamer configuration while the chain is up
    pub fn artifact_path(&self) -> Option<std::path::PathBuf> {
        self.shared
            .resources
            .lock()
            .chain
            .as_ref()
            .and_then(|c| c.artifact_path().map(|p| p.to_path_buf()))
    }

    /// Get forwarding statistics
    pub fn stats(&self) -> RelayStats {
        self.shared.counters.snapshot(*self.shared.started_at.lock())
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<relay: {} -> {} [{}]>", self.port, self.mount, self.state())
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("port", &self.port)
            .field("mount", &self.mount)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.shared.teardown();
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.handle.join();
        }
    }
}
