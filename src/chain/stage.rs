//! One external process in the relay chain

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use crate::config::StageCommand;
use crate::error::ChainError;

/// Position of a process in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Compressed stream in, raw audio out
    Decoder,
    /// Raw audio in, compressed stream out
    Encoder,
    /// Publishes the compressed stream
    Streamer,
}

impl StageKind {
    /// All stages in creation order
    pub const ORDER: [StageKind; 3] = [StageKind::Decoder, StageKind::Encoder, StageKind::Streamer];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Decoder => "decoder",
            StageKind::Encoder => "encoder",
            StageKind::Streamer => "streamer",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A running chain stage and its child handle
#[derive(Debug)]
pub struct StageProcess {
    kind: StageKind,
    program: String,
    child: Child,
    pid: u32,
    /// Set once the child has been reaped
    status: Option<ExitStatus>,
}

impl StageProcess {
    /// Spawn a stage with the given stdio wiring.
    ///
    /// `stdin` is moved into the command. When it wraps the previous stage's
    /// stdout, dropping the command on return closes the parent's copy of
    /// that pipe, leaving the two children as its only holders.
    pub fn spawn<I, S>(
        kind: StageKind,
        command: &StageCommand,
        extra_args: I,
        stdin: Stdio,
        stdout: Stdio,
    ) -> Result<Self, ChainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .args(extra_args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|source| ChainError::SpawnFailed {
            stage: kind.name(),
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::info!(stage = %kind, pid, program = %command.program, "Stage started");

        Ok(Self {
            kind,
            program: command.program.clone(),
            child,
            pid,
            status: None,
        })
    }

    /// Take the piped stdin, if any
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the piped stdout, if any
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit status, once the stage has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Check whether the stage is still running, reaping it if it exited
    pub fn is_alive(&mut self) -> io::Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.status = Some(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Ask the stage to exit (SIGTERM).
    ///
    /// Returns `false` without signalling when the stage was already reaped,
    /// so a recycled PID is never hit.
    pub fn terminate(&mut self) -> io::Result<bool> {
        if self.status.is_some() {
            return Ok(false);
        }
        send_terminate(&mut self.child)?;
        Ok(true)
    }

    /// Force the stage to exit (SIGKILL)
    pub fn kill(&mut self) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.child.kill()
    }

    /// Block until the stage exits and record its status
    pub fn reap(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(status)
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    // No graceful signal available; terminate outright
    child.kill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> StageCommand {
        StageCommand::new("sh", ["-c", script])
    }

    #[test]
    fn test_spawn_and_pipe() {
        let mut stage = StageProcess::spawn(
            StageKind::Decoder,
            &StageCommand::new("cat", Vec::<String>::new()),
            Vec::<String>::new(),
            Stdio::piped(),
            Stdio::piped(),
        )
        .unwrap();
        assert!(stage.pid() > 0);
        assert_eq!(stage.program(), "cat");

        let mut stdin = stage.take_stdin().unwrap();
        stdin.write_all(b"payload").unwrap();
        drop(stdin);

        let mut out = String::new();
        stage.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
        assert!(stage.reap().unwrap().success());
        assert!(!stage.is_alive().unwrap());
    }

    #[test]
    fn test_spawn_missing_program() {
        let result = StageProcess::spawn(
            StageKind::Encoder,
            &StageCommand::new("/nonexistent/relay-stage", Vec::<String>::new()),
            Vec::<String>::new(),
            Stdio::null(),
            Stdio::null(),
        );
        match result {
            Err(ChainError::SpawnFailed { stage, program, .. }) => {
                assert_eq!(stage, "encoder");
                assert_eq!(program, "/nonexistent/relay-stage");
            }
            other => panic!("expected spawn failure, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_then_reap() {
        let mut stage = StageProcess::spawn(
            StageKind::Streamer,
            &StageCommand::new("sleep", ["30"]),
            Vec::<String>::new(),
            Stdio::null(),
            Stdio::null(),
        )
        .unwrap();
        assert!(stage.is_alive().unwrap());
        assert!(stage.terminate().unwrap());

        let status = stage.reap().unwrap();
        assert!(!status.success());
        // Reaped stages are never signalled again
        assert!(!stage.terminate().unwrap());
        assert!(stage.kill().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_ignores_sigterm_handler() {
        let mut stage = StageProcess::spawn(
            StageKind::Decoder,
            &sh("trap '' TERM; sleep 30"),
            Vec::<String>::new(),
            Stdio::null(),
            Stdio::null(),
        )
        .unwrap();
        // Give the shell time to install the trap
        std::thread::sleep(Duration::from_millis(100));
        stage.terminate().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(stage.is_alive().unwrap());

        let started = Instant::now();
        stage.kill().unwrap();
        stage.reap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = StageKind::ORDER.iter().map(StageKind::name).collect();
        assert_eq!(names, ["decoder", "encoder", "streamer"]);
    }
}
