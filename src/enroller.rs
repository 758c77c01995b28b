//! Enroller child process management and the Core↔Enroller record
//! protocol.
//!
//! When a group becomes active the Core re-executes its own binary with
//! the hidden `enroller` subcommand. The child receives the resolved
//! runtime state as one JSON document on stdin, runs a second engine bound
//! to the group interface, and reports back by writing tab-separated
//! records to its stdout, which the Core wired to the slave side of its
//! own pty: every record surfaces as an ordinary input line in the Core's
//! event stream.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::channel::LineChannel;
use crate::config::Config;
use crate::error::P2pError;

/// Registry update: `HOSTP2PD_ADD_REGISTER\t<MAC>\t<NAME>\t<TYPE>`.
pub const ADD_REGISTER_RECORD: &str = "HOSTP2PD_ADD_REGISTER";
/// Statistics tally: `HOSTP2PD_STATISTICS\t<EVENT_NAME>`.
pub const STATISTICS_RECORD: &str = "HOSTP2PD_STATISTICS";
/// Session count: `HOSTP2PD_ACTIVE_SESSIONS\t<N>`.
pub const ACTIVE_SESSIONS_RECORD: &str = "HOSTP2PD_ACTIVE_SESSIONS";
/// The Enroller is going away; the Core clears its group bookkeeping.
pub const TERMINATE_ENROLLER_RECORD: &str = "HOSTP2PD_TERMINATE_ENROLLER";

/// Runtime state handed to the Enroller child over stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollerHandoff {
    pub config: Config,
    /// Group interface the child binds its control client to.
    pub group: String,
    /// Enrolment method as resolved by the Core at activation time.
    pub pbc_in_use: Option<bool>,
    /// Configuration file re-read on SIGHUP, if any.
    pub config_file: Option<std::path::PathBuf>,
}

/// Write half of the Enroller→Core back-channel.
pub struct BackChannel {
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
}

impl BackChannel {
    /// The child's stdout, which the Core connected to its pty slave.
    pub fn stdout() -> BackChannel {
        BackChannel {
            writer: Box::new(tokio::io::stdout()),
        }
    }

    /// Arbitrary sink (tests).
    pub fn from_writer(writer: Box<dyn AsyncWrite + Send + Sync + Unpin>) -> BackChannel {
        BackChannel { writer }
    }

    async fn send(&mut self, record: String) -> Result<(), P2pError> {
        debug!("record: {record:?}");
        self.writer.write_all(record.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_register(
        &mut self,
        mac: &str,
        name: &str,
        device_type: &str,
    ) -> Result<(), P2pError> {
        self.send(format!("{ADD_REGISTER_RECORD}\t{mac}\t{name}\t{device_type}"))
            .await
    }

    pub async fn send_statistics(&mut self, event_name: &str) -> Result<(), P2pError> {
        self.send(format!("{STATISTICS_RECORD}\t{event_name}")).await
    }

    pub async fn send_active_sessions(&mut self, stations: u32) -> Result<(), P2pError> {
        self.send(format!("{ACTIVE_SESSIONS_RECORD}\t{stations}"))
            .await
    }

    pub async fn send_terminate(&mut self) -> Result<(), P2pError> {
        self.send(TERMINATE_ENROLLER_RECORD.to_string()).await
    }
}

/// Core-side handle to the Enroller bound to the active group.
pub struct EnrollerHandle {
    child: Option<Child>,
    group: String,
}

impl EnrollerHandle {
    /// Re-exec this binary as `enroller`, with stdout wired into the
    /// Core's pty slave and the handoff document written to stdin. The
    /// child receives SIGTERM if the Core dies first.
    pub async fn spawn(
        channel: &LineChannel,
        handoff: &EnrollerHandoff,
    ) -> Result<EnrollerHandle, P2pError> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command
            .arg("enroller")
            .stdin(Stdio::piped())
            .stdout(channel.slave_stdio()?)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        unsafe {
            command.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGTERM)
                    .map_err(std::io::Error::from)
            });
        }
        let mut child = command.spawn()?;
        let document = serde_json::to_vec(handoff)
            .map_err(|e| P2pError::Config(format!("cannot serialize enroller handoff: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| P2pError::ChannelClosed("enroller stdin".to_string()))?;
        stdin.write_all(&document).await?;
        stdin.shutdown().await?;
        debug!(
            "enroller started for group {:?}, pid={:?}",
            handoff.group,
            child.id()
        );
        Ok(EnrollerHandle {
            child: Some(child),
            group: handoff.group.clone(),
        })
    }

    /// Handle without a process behind it; stands in for the child when
    /// subprocess spawning is disabled (tests).
    pub fn inert(group: &str) -> EnrollerHandle {
        EnrollerHandle {
            child: None,
            group: group.to_string(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// The child exited on its own; the Core must clear its bookkeeping.
    pub fn exited(&mut self) -> bool {
        match &mut self.child {
            Some(child) => child.try_wait().ok().flatten().is_some(),
            None => false,
        }
    }

    /// Ask the child to reload its configuration.
    pub fn signal_reload(&self) {
        self.signal(nix::sys::signal::Signal::SIGHUP);
    }

    fn signal(&self, signal: nix::sys::signal::Signal) {
        if let Some(id) = self.child.as_ref().and_then(Child::id) {
            if let Err(e) =
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(id as i32), signal)
            {
                warn!("cannot signal enroller pid {id}: {e}");
            }
        }
    }

    /// Stop the child and reap it.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        debug!("terminating enroller for group {:?}", self.group);
        if let Some(id) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(id as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        match tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => debug!("enroller exited with {status}"),
            _ => {
                warn!("enroller did not stop in time; killing");
                let _ = child.kill().await;
            }
        }
    }
}

/// Entry point of the `enroller` subcommand: read the handoff from stdin,
/// attach a fresh control client to the group interface and run the
/// enrolment engine.
pub async fn child_main() -> Result<(), P2pError> {
    use tokio::io::AsyncReadExt;

    let mut document = String::new();
    tokio::io::stdin()
        .read_to_string(&mut document)
        .await?;
    let handoff: EnrollerHandoff = serde_json::from_str(&document)
        .map_err(|e| P2pError::Config(format!("invalid enroller handoff: {e}")))?;

    let mut config = handoff.config.clone();
    // This process is bound to the group, not the generic p2p-dev one.
    config.interface = handoff.group.clone();
    let channel = LineChannel::spawn(&config.p2p_client, Some(&handoff.group))?;
    let mut engine = crate::engine::Engine::new(
        config,
        handoff.config_file.clone(),
        channel,
        crate::engine::Role::Enroller {
            back: BackChannel::stdout(),
        },
    );
    engine.set_group(&handoff.group);
    engine.set_pbc_in_use(handoff.pbc_in_use);

    let control = engine.control();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
        let mut sighup = signal(SignalKind::hangup()).expect("signal handler");
        loop {
            tokio::select! {
                _ = sigterm.recv() => { control.terminate().await; }
                _ = sigint.recv() => { control.terminate().await; }
                _ = sighup.recv() => { control.reload().await; }
            }
        }
    });

    engine.run().await
}
